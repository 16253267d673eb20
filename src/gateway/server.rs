//! HTTP + WebSocket 接入（axum）
//!
//! - GET  /              测试页面
//! - POST /chat/:id      同步处理一条消息：广播结果并返回
//! - GET  /chat/:id      WebSocket：每个文本帧是一条消息；旁白只缓冲，直接提问的非空回复广播给所有连接
//! - GET  /reset_chat    清空旁白缓冲与对话历史

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{Html, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{AppContext, ChatTurn};
use crate::gateway::{ChannelListener, ChatResult};

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/chat/:id", get(chat_ws).post(chat_http))
        .route("/reset_chat", get(reset_chat))
        .with_state(ctx)
}

/// 绑定配置中的地址并运行，直到 shutdown 被取消
pub async fn serve(ctx: Arc<AppContext>, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    serve_on(listener, ctx, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Fuyuka API listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index() -> Html<String> {
    let template = serde_json::to_string_pretty(&ChatTurn::default()).unwrap_or_default();
    Html(include_str!("../../static/index.html").replace("__CHAT_TEMPLATE__", &template))
}

async fn chat_http(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(turn): Json<ChatTurn>,
) -> Json<ChatResult> {
    let result = ctx.dispatcher.dispatch(&id, turn).await;
    ctx.hub.broadcast_json(&result).await;
    Json(result)
}

async fn reset_chat(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    ctx.dispatcher.reset().await;
    Json(json!({ "result": true }))
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, id, ctx))
}

async fn handle_socket(socket: WebSocket, id: String, ctx: Arc<AppContext>) {
    let (mut sender, mut receiver) = socket.split();
    let listener_id = format!("ws_{}_{}", id, uuid::Uuid::new_v4());
    let (listener, mut rx) = ChannelListener::new(listener_id.clone());
    ctx.hub.attach(Arc::new(listener)).await;
    info!(client = %id, listener = %listener_id, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(client = %id, error = %e, "websocket receive failed");
                break;
            }
        };

        let turn: ChatTurn = match serde_json::from_str(&text) {
            Ok(turn) => turn,
            Err(e) => {
                warn!(client = %id, error = %e, "malformed turn, skipped");
                continue;
            }
        };

        // 旁白按到达顺序就地处理，不广播
        let result = ctx.dispatcher.dispatch(&id, turn).await;
        if result.request.noisy || result.response.is_empty() {
            continue;
        }
        ctx.hub.broadcast_json(&result).await;
    }

    ctx.hub.detach(&listener_id).await;
    writer.abort();
    ctx.hub
        .broadcast(&format!("Client #{id} left the chat"))
        .await;
    info!(client = %id, "client disconnected");
}
