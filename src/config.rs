//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FUYUKA__*` 覆盖（双下划线表示嵌套，如 `FUYUKA__GOOGLE__MODEL=gemini-2.5-flash`）。
//! `FUYUKA__GOOGLE__API_KEYS` 支持逗号分隔的多个 Key（用于额度耗尽时轮换）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::GEMINI_BASE_URL;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub google: GoogleSection,
    pub session: SessionSection,
    pub narration: NarrationSection,
    pub retry: RetrySection,
    pub prompts: PromptsSection,
}

impl AppConfig {
    /// 对话历史文件：{cache_dir}/{name}_chat_history.json
    pub fn history_path(&self) -> PathBuf {
        self.app
            .cache_dir
            .join(format!("{}_chat_history.json", self.app.name))
    }

    /// 当前 API Key 下标文件：{cache_dir}/{name}_api_key_index.txt
    pub fn key_index_path(&self) -> PathBuf {
        self.app
            .cache_dir
            .join(format!("{}_api_key_index.txt", self.app.name))
    }
}

/// [app] 段：应用名、缓存目录、提示词根目录、日志文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 持久化文件（历史、Key 下标）所在目录
    pub cache_dir: PathBuf,
    /// prompts/、messages/ 的根目录
    pub base_dir: PathBuf,
    /// 设置后额外写一份无颜色的日志文件
    pub log_file: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "fuyuka".to_string(),
            cache_dir: PathBuf::from("cache"),
            base_dir: PathBuf::from("."),
            log_file: None,
        }
    }
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// [google] 段：Gemini 模型、Key 列表、超时、安全阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleSection {
    /// 按顺序轮换；至少需要一个
    pub api_keys: Vec<String>,
    pub model: String,
    pub base_url: String,
    /// 单次请求超时（秒）
    pub timeout_secs: u64,
    /// 是否启用 Google Search grounding 工具
    pub search_grounding: bool,
    /// 安全类别 -> 拦截阈值
    pub safety: BTreeMap<String, String>,
}

impl Default for GoogleSection {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            model: "gemini-2.5-flash".to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            timeout_secs: 60,
            search_grounding: false,
            safety: default_safety(),
        }
    }
}

/// 骚扰容许中等、仇恨言论从严、色情仅拦高、游戏场景放开危险内容
fn default_safety() -> BTreeMap<String, String> {
    [
        ("HARM_CATEGORY_HARASSMENT", "BLOCK_MEDIUM_AND_ABOVE"),
        ("HARM_CATEGORY_HATE_SPEECH", "BLOCK_LOW_AND_ABOVE"),
        ("HARM_CATEGORY_SEXUALLY_EXPLICIT", "BLOCK_ONLY_HIGH"),
        ("HARM_CATEGORY_DANGEROUS_CONTENT", "BLOCK_NONE"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// [session] 段：历史保留条数、启动时是否恢复上次会话
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 历史记录条数上限（user + model 各算一条）
    pub max_history_length: usize,
    pub resume: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_history_length: 200,
            resume: true,
        }
    }
}

/// [narration] 段：旁白合批阈值与确认指令
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationSection {
    /// 累计字符数超过该值才送出一批
    pub threshold: usize,
    pub separator: String,
    pub acknowledge_instruction: String,
}

impl Default for NarrationSection {
    fn default() -> Self {
        Self {
            threshold: 1000,
            separator: " ".to_string(),
            acknowledge_instruction: "You understand the flow of the story. reply OK".to_string(),
        }
    }
}

/// [retry] 段：思考泄漏检测词与重试上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 大小写不敏感
    pub leak_markers: Vec<String>,
    pub max_leak_retries: usize,
    /// `{date_time}` 会替换为原消息时间
    pub corrective_template: String,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            leak_markers: vec![
                "プロセス".into(),
                "考え中".into(),
                "thinking".into(),
                "thought".into(),
            ],
            max_leak_retries: 2,
            corrective_template: "Your reply to the message sent at {date_time} exposed your \
                                  internal thinking process. Answer again without any reasoning."
                .to_string(),
        }
    }
}

/// [prompts] 段：提示词与固定回复文本的相对路径（相对 app.base_dir）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    pub base_prompt: PathBuf,
    pub additional_requests_prompt: PathBuf,
    pub error_message: PathBuf,
    pub stop_candidate_message: PathBuf,
    pub resource_exhausted_message: PathBuf,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            base_prompt: "prompts/base_prompt.txt".into(),
            additional_requests_prompt: "prompts/additional_requests_prompt.txt".into(),
            error_message: "messages/error_message.txt".into(),
            stop_candidate_message: "messages/stop_candidate_message.txt".into(),
            resource_exhausted_message: "messages/resource_exhausted_message.txt".into(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FUYUKA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FUYUKA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FUYUKA")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("google.api_keys")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
