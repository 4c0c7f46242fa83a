//! Account-tier operations: login, verification, profile, record lists.
//!
//! All of these converse with the single account client; each script
//! holds its advisory lock for the whole exchange.

use serde_json::Value;

use crate::ops::{account, embedded_uid, parse_json, OpError, OpResult};
use crate::registry::Registry;

/// Log in. Username goes out fire-and-forget, the password round-trip
/// answers with the minted session cookie — or an account-service error
/// string; the body is returned verbatim either way, as the account
/// service defines its shape.
pub async fn login(registry: &Registry, username: &str, password: &str) -> OpResult<String> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    client.send_only(b'L', username).await?;
    let resp = client.send_and_wait(b'L', password).await?;
    Ok(resp.body)
}

/// Check a session cookie against the account service.
pub async fn verify_cookie(registry: &Registry, cookie: &str) -> OpResult<bool> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'V', cookie).await?;
    Ok(resp.body == "Y")
}

/// Short profile query: `[username, publiccode]` for the cookie's user.
pub async fn get_info_short(registry: &Registry, cookie: &str) -> OpResult<Value> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'V', cookie).await?;
    if resp.body != "Y" {
        return Err(OpError::VerificationFailed);
    }
    let uid = embedded_uid(cookie)?;
    let resp = client.send_and_wait(b'Q', &uid).await?;
    parse_json(&resp.body)
}

/// Update username, password, and the public-code flag. The first `'C'`
/// round-trip doubles as this operation's verification gate.
pub async fn update_info(
    registry: &Registry,
    cookie: &str,
    username: &str,
    password: &str,
    public_code: &str,
) -> OpResult<()> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'C', cookie).await?;
    if resp.body == "N" {
        return Err(OpError::VerificationFailed);
    }
    client.send_only(b'U', username).await?;
    client.send_only(b'P', password).await?;
    let resp = client.send_and_wait(b'C', public_code).await?;
    if resp.body == "Y" {
        Ok(())
    } else {
        Err(OpError::Rejected(resp.body))
    }
}

/// One page of the caller's submission records.
pub async fn get_record_list(registry: &Registry, cookie: &str, page: &str) -> OpResult<Value> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'V', cookie).await?;
    if resp.body != "Y" {
        return Err(OpError::VerificationFailed);
    }
    let uid = embedded_uid(cookie)?;
    client.send_only(b'G', &uid).await?;
    let resp = client.send_and_wait(b'G', page).await?;
    if resp.tag == b'O' {
        parse_json(&resp.body)
    } else {
        Err(OpError::Rejected(resp.body))
    }
}
