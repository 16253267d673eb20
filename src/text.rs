//! 文本工具：HTML 清洗、换行压平、提示词文件读取

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

fn img_alt_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<img\s+[^>]*?\s*alt=["']([^"']+?)["'][^>]*?/?>"#)
            .expect("valid img regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag regex"))
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// 清洗聊天内容中的 HTML：
/// 1. 带 alt 的 `<img>` 替换为 alt 值（前后加空格，表情包就是这样传进来的）
/// 2. 其余标签一律替换为空格
/// 3. 连续空白压成一个，首尾去空白
pub fn clean_and_extract_alt(text: &str) -> String {
    let with_alt = img_alt_pattern().replace_all(text, " $1 ");
    let without_tags = tag_pattern().replace_all(&with_alt, " ");
    whitespace_pattern()
        .replace_all(&without_tags, " ")
        .trim()
        .to_string()
}

/// 回复中的 CR/LF 替换为空格（下游按单行朗读）
pub fn remove_newlines(text: &str) -> String {
    text.replace(|c: char| c == '\r' || c == '\n', " ")
}

/// 读取 base_dir 下的文本文件；不存在时读同名 `.template`，都没有则返回空串
pub fn read_text(base_dir: &Path, name: &Path) -> String {
    let path = base_dir.join(name);
    let path = if path.is_file() {
        path
    } else {
        let mut template = path.into_os_string();
        template.push(".template");
        let template = std::path::PathBuf::from(template);
        if !template.is_file() {
            return String::new();
        }
        template
    };

    match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read text file");
            String::new()
        }
    }
}
