//! Code submission and record queries.

use serde_json::Value;
use tracing::warn;

use crate::ids;
use crate::ops::{
    account, embedded_uid, parse_json, parse_sequence, require_verified, OpError, OpResult,
};
use crate::registry::{JudgeCapability, Registry};

/// Compiler/version strings the judge tier accepts.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "C++14", "C++14-O2", "C++17", "C++17-O2", "C++20", "C++20-O2",
];

fn language_supported(language: &str) -> bool {
    SUPPORTED_LANGUAGES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(language))
}

/// Result view for a single record query.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Short result: the submission exists but has not been fully judged.
    Pending(Value),
    /// Full result; `source` is `None` when the caller is not allowed to
    /// see the code.
    Full {
        result: Value,
        source: Option<String>,
    },
}

/// Submit code for judging; returns the composite record id.
///
/// After the judge accepts, the id is reported to the account tier so
/// record lists can include it. The transport has no cross-service
/// transactions: a failure of that report is logged and the submission
/// still counts as accepted (known consistency gap).
pub async fn submit(
    registry: &Registry,
    cookie: &str,
    problem_id: &str,
    language: &str,
    code: &str,
) -> OpResult<String> {
    if !language_supported(language) {
        return Err(OpError::UnsupportedLanguage(language.to_string()));
    }
    require_verified(registry, cookie).await?;
    let uid = embedded_uid(cookie)?;

    let server = registry
        .select_server(JudgeCapability::Submit)
        .ok_or(OpError::NoJudgeAvailable)?;
    let client = registry
        .judge_client(server, JudgeCapability::Submit)
        .ok_or(OpError::ServiceUnavailable("Judge"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Judge"));
    }

    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'S', &uid).await?;
    if resp.tag == b'E' {
        return Err(OpError::Rejected(resp.body));
    }
    let resp = client.send_and_wait(b'O', problem_id).await?;
    if resp.tag == b'E' {
        return Err(OpError::Rejected(resp.body));
    }
    client.send_only(b'O', language).await?;
    let resp = client.send_and_wait(b'F', code).await?;
    if resp.tag != b'O' {
        return Err(OpError::Rejected(resp.body));
    }

    let record_id = ids::build_record_id(server, parse_sequence(&resp.body)?)?;

    if let Err(e) = report_record(registry, &uid, &record_id).await {
        warn!(record_id = %record_id, error = %e,
              "Submission accepted but account-tier report failed");
    }

    Ok(record_id)
}

/// Tell the account tier about an accepted submission.
async fn report_record(registry: &Registry, uid: &str, record_id: &str) -> OpResult<()> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    client.send_only(b'R', uid).await?;
    client.send_only(b'R', record_id).await?;
    Ok(())
}

/// Fetch one record in detail, routed to its owning judge server by the
/// composite id.
///
/// When the full result file is not available yet, the short query
/// distinguishes "not yet judged" (non-negative score) from "no such
/// record" (negative score). A full result additionally asks the account
/// tier whether the caller may see the source code, and redacts it
/// otherwise.
pub async fn get_record(registry: &Registry, cookie: &str, record_id: &str) -> OpResult<Record> {
    require_verified(registry, cookie).await?;

    let id = ids::parse_record_id(record_id)?;
    let client = registry
        .judge_client(id.server_id, JudgeCapability::Query)
        .ok_or(OpError::ServiceUnavailable("Judge"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Judge"));
    }

    let _lock = client.acquire_lock().await?;
    let sequence = id.sequence.to_string();
    let resp = client.send_and_wait(b'R', &sequence).await?;
    if resp.tag == b'E' {
        let resp = client.send_and_wait(b'Q', &sequence).await?;
        let short = parse_json(&resp.body)?;
        let pts = short
            .get("pts")
            .and_then(Value::as_f64)
            .ok_or_else(|| OpError::Malformed("Short result without pts".to_string()))?;
        if pts < 0.0 {
            return Err(OpError::UnknownRecord);
        }
        return Ok(Record::Pending(short));
    }

    let result = parse_json(&resp.body)?;
    let owner = record_owner(&result)?;

    let source = if source_allowed(registry, cookie, &owner).await? {
        let resp = client.send_and_wait(b'C', &sequence).await?;
        Some(resp.body)
    } else {
        None
    };

    Ok(Record::Full { result, source })
}

/// Ask the account tier whether the caller may see source code owned by
/// `owner`.
async fn source_allowed(registry: &Registry, cookie: &str, owner: &str) -> OpResult<bool> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    client.send_only(b'A', cookie).await?;
    let resp = client.send_and_wait(b'A', owner).await?;
    Ok(resp.tag == b'O')
}

fn record_owner(result: &Value) -> OpResult<String> {
    match result.get("uid") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(OpError::Malformed("Record result without uid".to_string())),
    }
}
