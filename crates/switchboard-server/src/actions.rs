//! Built-in request actions.

use serde_json::{Value, json};
use switchboard_core::events::names;
use switchboard_core::{Broadcast, BroadcastTarget, ChannelId, RequestEnvelope, WebSocketEvent};
use switchboard_rpc::validation::{optional_str, required_str};
use switchboard_rpc::{ActionRegistry, RequestContext, RpcError};

/// Liveness probe answered by the node handling the connection.
pub const PING: &str = "ping";
/// Typing indicator, relayed to the rest of the channel.
pub const USER_TYPING: &str = "user_typing";

/// Register every built-in action.
pub fn register_builtin_actions(registry: &mut ActionRegistry) {
    registry.register_fn(PING, |_req, ctx| async move { Ok::<_, RpcError>(ping(&ctx)) });
    registry.register_fn(USER_TYPING, |req, ctx| async move { user_typing(&req, &ctx).await });
}

fn ping(ctx: &RequestContext) -> Value {
    json!({
        "text": "pong",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": ctx.hub.node_id(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    })
}

async fn user_typing(req: &RequestEnvelope, ctx: &RequestContext) -> Result<Value, RpcError> {
    let channel_id = required_str(req, "channel_id")?;
    let parent_id = optional_str(req, "parent_id")?.unwrap_or_default();

    let payload = WebSocketEvent::new(names::TYPING)
        .with("user_id", ctx.user_id.as_str())
        .with("channel_id", channel_id)
        .with("parent_id", parent_id);
    let broadcast = Broadcast::new(
        payload,
        BroadcastTarget::Channel {
            channel_id: ChannelId::from(channel_id),
        },
    )
    .omit_user(ctx.user_id.clone());
    ctx.hub.broadcast(broadcast).await;
    Ok(Value::Null)
}
