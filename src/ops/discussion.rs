//! Discussion operations, addressed by composite thread ids.
//!
//! New threads land on any available discussion-capable server; follow-up
//! posts and reads route themselves to the owning server through the id.

use serde_json::Value;

use crate::client::SessionClient;
use crate::ids;
use crate::ops::{embedded_uid, parse_json, parse_sequence, require_verified, OpError, OpResult};
use crate::registry::{JudgeCapability, Registry};

fn discussion_client(registry: &Registry, server_id: u8) -> OpResult<SessionClient> {
    let client = registry
        .judge_client(server_id, JudgeCapability::Discussion)
        .ok_or(OpError::ServiceUnavailable("Discussion"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Discussion"));
    }
    Ok(client)
}

/// Open a new thread; returns its composite id.
pub async fn new_discussion(
    registry: &Registry,
    cookie: &str,
    title: &str,
    content: &str,
) -> OpResult<String> {
    require_verified(registry, cookie).await?;
    let uid = embedded_uid(cookie)?;

    let server = registry
        .select_server(JudgeCapability::Discussion)
        .ok_or(OpError::NoJudgeAvailable)?;
    let client = discussion_client(registry, server)?;

    let _lock = client.acquire_lock().await?;
    client.send_only(b'S', content).await?;
    client.send_only(b'S', title).await?;
    let resp = client.send_and_wait(b'S', &uid).await?;
    if resp.tag != b'Y' {
        return Err(OpError::Rejected(resp.body));
    }
    let sequence = parse_sequence(&resp.body)?;
    Ok(ids::build_record_id(server, sequence)?)
}

/// Reply to an existing thread.
pub async fn post_discussion(
    registry: &Registry,
    cookie: &str,
    thread_id: &str,
    content: &str,
) -> OpResult<()> {
    require_verified(registry, cookie).await?;
    let uid = embedded_uid(cookie)?;

    let id = ids::parse_record_id(thread_id)?;
    let client = discussion_client(registry, id.server_id)?;

    let _lock = client.acquire_lock().await?;
    client.send_only(b'P', &id.sequence.to_string()).await?;
    client.send_only(b'S', content).await?;
    let resp = client.send_and_wait(b'S', &uid).await?;
    if resp.body == "Y" {
        Ok(())
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

/// Fetch one page of a thread.
pub async fn get_discussion(
    registry: &Registry,
    cookie: &str,
    thread_id: &str,
    page: &str,
) -> OpResult<Value> {
    require_verified(registry, cookie).await?;

    let id = ids::parse_record_id(thread_id)?;
    let client = discussion_client(registry, id.server_id)?;

    let _lock = client.acquire_lock().await?;
    client.send_only(b'G', &id.sequence.to_string()).await?;
    let resp = client.send_and_wait(b'S', page).await?;
    if resp.tag == b'Y' {
        parse_json(&resp.body)
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

/// Fetch one page of the thread catalogue from any available
/// discussion-capable server.
pub async fn get_discussion_list(registry: &Registry, cookie: &str, page: &str) -> OpResult<Value> {
    require_verified(registry, cookie).await?;

    let server = registry
        .select_server(JudgeCapability::Discussion)
        .ok_or(OpError::NoJudgeAvailable)?;
    let client = discussion_client(registry, server)?;

    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'L', page).await?;
    if resp.tag == b'Y' {
        parse_json(&resp.body)
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::harness::{judge, registry_for, COOKIE};
    use crate::testutil::{send, Reply, ScriptedPeer};

    #[tokio::test]
    async fn test_new_discussion_builds_composite_id() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let disc = ScriptedPeer::spawn(vec![Reply::None, Reply::None, send(b'Y', "00000A")]).await;
        let registry = registry_for(
            Some(account.addr.port()),
            None,
            vec![judge(1, None, None, Some(disc.addr.port()))],
        )
        .await;

        let id = new_discussion(&registry, COOKIE, "Help with P1001", "How do I...")
            .await
            .unwrap();
        assert_eq!(id, "0100000A");
        assert_eq!(disc.frames_seen(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_discussion_routes_by_id() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y"), send(b'V', "Y")]).await;
        let disc = ScriptedPeer::spawn(vec![Reply::None, Reply::None, send(b'S', "Y")]).await;
        let registry = registry_for(
            Some(account.addr.port()),
            None,
            vec![judge(1, None, None, Some(disc.addr.port()))],
        )
        .await;

        post_discussion(&registry, COOKIE, "01000005", "me too")
            .await
            .unwrap();

        // A thread owned by an unconfigured server cannot be routed.
        let result = post_discussion(&registry, COOKIE, "02000005", "me too").await;
        assert!(matches!(result, Err(OpError::ServiceUnavailable(_))));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_discussion_rejects_bad_id_before_network() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let registry = registry_for(Some(account.addr.port()), None, vec![]).await;

        let result = get_discussion(&registry, COOKIE, "not-hex!", "1").await;
        assert!(matches!(result, Err(OpError::InvalidId(_))));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_discussion_page() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let disc = ScriptedPeer::spawn(vec![
            Reply::None,
            send(b'Y', r#"[["abcde","first post"],["fghij","second"]]"#),
        ])
        .await;
        let registry = registry_for(
            Some(account.addr.port()),
            None,
            vec![judge(1, None, None, Some(disc.addr.port()))],
        )
        .await;

        let page = get_discussion(&registry, COOKIE, "01000005", "1")
            .await
            .unwrap();
        assert_eq!(page[0][1], "first post");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_discussion_list_needs_available_server() {
        let account = ScriptedPeer::spawn(vec![send(b'V', "Y")]).await;
        let registry = registry_for(Some(account.addr.port()), None, vec![]).await;

        let result = get_discussion_list(&registry, COOKIE, "1").await;
        assert!(matches!(result, Err(OpError::NoJudgeAvailable)));
        registry.shutdown().await;
    }
}
