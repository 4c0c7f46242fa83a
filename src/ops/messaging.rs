//! Private-message operations via the message-capable middle connection.

use serde_json::Value;

use crate::client::SessionClient;
use crate::ops::{embedded_uid, parse_json, require_verified, OpError, OpResult};
use crate::registry::Registry;

fn message_client(registry: &Registry) -> OpResult<SessionClient> {
    let client = registry
        .message_client()
        .ok_or(OpError::ServiceUnavailable("Message"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Message"));
    }
    Ok(client)
}

/// Send a private message to `target`, keyed by the sender's embedded
/// user id.
pub async fn post_message(
    registry: &Registry,
    cookie: &str,
    target: &str,
    content: &str,
) -> OpResult<()> {
    let client = message_client(registry)?;
    require_verified(registry, cookie).await?;
    let uid = embedded_uid(cookie)?;

    let _lock = client.acquire_lock().await?;
    client.send_only(b'R', &uid).await?;
    client.send_only(b'R', content).await?;
    let resp = client.send_and_wait(b'R', target).await?;
    if resp.tag == b'O' {
        Ok(())
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

/// Fetch one page of the caller's messages.
pub async fn get_messages(registry: &Registry, cookie: &str, page: &str) -> OpResult<Value> {
    let client = message_client(registry)?;
    require_verified(registry, cookie).await?;
    let uid = embedded_uid(cookie)?;

    let _lock = client.acquire_lock().await?;
    client.send_only(b'G', &uid).await?;
    let resp = client.send_and_wait(b'G', page).await?;
    if resp.tag == b'O' {
        parse_json(&resp.body)
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::harness::{registry_for, COOKIE};
    use crate::testutil::{send, Reply, ScriptedPeer};

    #[tokio::test]
    async fn test_post_message() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let message = ScriptedPeer::spawn(vec![Reply::None, Reply::None, send(b'O', "")]).await;
        let registry = registry_for(
            Some(account.addr.port()),
            Some(message.addr.port()),
            vec![],
        )
        .await;

        post_message(&registry, COOKIE, "fghij", "hello there")
            .await
            .unwrap();
        assert_eq!(message.frames_seen(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_message_rejection() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let message = ScriptedPeer::spawn(vec![Reply::None, Reply::None, send(b'E', "no such user")]).await;
        let registry = registry_for(
            Some(account.addr.port()),
            Some(message.addr.port()),
            vec![],
        )
        .await;

        let result = post_message(&registry, COOKIE, "nobody", "hi").await;
        assert!(matches!(result, Err(OpError::Rejected(msg)) if msg == "no such user"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_messages_page() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let message = ScriptedPeer::spawn(vec![
            Reply::None,
            send(b'O', r#"[["fghij","hi"],["klmno","yo"]]"#),
        ])
        .await;
        let registry = registry_for(
            Some(account.addr.port()),
            Some(message.addr.port()),
            vec![],
        )
        .await;

        let page = get_messages(&registry, COOKIE, "1").await.unwrap();
        assert_eq!(page[1][0], "klmno");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_requires_message_service() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let registry = registry_for(Some(account.addr.port()), None, vec![]).await;

        let result = post_message(&registry, COOKIE, "fghij", "hi").await;
        assert!(matches!(result, Err(OpError::ServiceUnavailable("Message"))));
        // The account client was never bothered.
        assert_eq!(account.frames_seen(), 0);
        registry.shutdown().await;
    }
}
