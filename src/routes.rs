//! HTTP routes for opening requests and committing their bundles.

use std::io;
use std::sync::{MutexGuard, PoisonError};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::message::{extract_addresses, Bundle, MessageError, Request, Response, Verdict};
use crate::model::{AppendRejection, Block, BundleBlock, RequestBlock};
use crate::storage::{self, LocalChain, StoreError};
use crate::AppState;

type ApiError = (StatusCode, String);

/// Lock the ledger. A poisoned lock is still consistent: appends check
/// everything before they push.
fn ledger(state: &AppState) -> MutexGuard<'_, LocalChain> {
    state.ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write the current chain to its snapshot file, bounded by the save timeout.
///
/// Saves are serialized so an older snapshot can never land after a newer one:
/// the save lock travels with the blocking write and is released only when the
/// write ends. `Timeout` therefore means "not confirmed", the write may still
/// land afterwards.
pub async fn persist(state: &AppState) -> Result<(), StoreError> {
    let saving = state.save_lock.clone().lock_owned().await;
    let (path, bytes) = {
        let guard = ledger(state);
        (guard.path().to_path_buf(), storage::encode(guard.chain())?)
    };

    let write = tokio::task::spawn_blocking(move || {
        let _saving = saving;
        storage::write_snapshot(&path, &bytes)
    });
    match tokio::time::timeout(state.save_timeout, write).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::Io(io::Error::other(join))),
        Err(_) => Err(StoreError::Timeout(state.save_timeout)),
    }
}

/// Save after a committed append. The block stays on the chain either way, so
/// a failed save is reported to the client as `saved: false`, not as an error.
async fn save_committed(state: &AppState) -> bool {
    match persist(state).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to save chain: {e}");
            false
        }
    }
}

fn rejected(e: AppendRejection) -> ApiError {
    (StatusCode::CONFLICT, e.to_string())
}

fn single_line(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, format!("{field} must not be empty")));
    }
    if value.contains(['\n', '\r']) {
        return Err((StatusCode::BAD_REQUEST, format!("{field} must be a single line")));
    }
    Ok(())
}

fn default_action() -> String {
    "approval".into()
}

#[derive(Debug, Deserialize)]
pub struct RequestInput {
    pub message: String,
    #[serde(default = "default_action")]
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct RequestOutput {
    pub block: RequestBlock,
    /// Block of text to paste into the circulation email.
    pub email: String,
    /// Whether the snapshot on disk includes this block yet.
    pub saved: bool,
}

/// POST /request
pub async fn open_request(
    State(state): State<AppState>,
    Json(payload): Json<RequestInput>,
) -> Result<(StatusCode, Json<RequestOutput>), ApiError> {
    single_line("message", &payload.message)?;
    single_line("action", &payload.action)?;
    let request = Request::new(payload.message.trim(), payload.action.trim());

    let block = {
        let mut guard = ledger(&state);
        let block = RequestBlock::new(&request, guard.chain().head().hash());
        guard
            .chain_mut()
            .try_append(block.clone())
            .map_err(rejected)?;
        block
    };
    let saved = save_committed(&state).await;

    info!(request_id = %request.id, saved, "Request opened");
    Ok((
        StatusCode::CREATED,
        Json(RequestOutput {
            email: request.format_as_email(),
            block,
            saved,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BundleInput {
    pub request_id: String,
    /// Raw recipient header, e.g. `"Alice" <a@x.com>, b@y.org`.
    pub recipients: String,
    #[serde(default)]
    pub responses: Vec<Response>,
}

#[derive(Debug, Deserialize)]
pub struct BundleEmailInput {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct BundleOutput {
    pub block: BundleBlock,
    pub verdict: Verdict,
    pub email: String,
    /// Whether the snapshot on disk includes this block yet.
    pub saved: bool,
}

/// POST /bundle: tally the collected votes and commit the outcome.
pub async fn close_request(
    State(state): State<AppState>,
    Json(payload): Json<BundleInput>,
) -> Result<(StatusCode, Json<BundleOutput>), ApiError> {
    let request = ledger(&state)
        .chain()
        .find_request_block(&payload.request_id)
        .map(RequestBlock::request)
        .ok_or((StatusCode::NOT_FOUND, "request not found".into()))?;

    // senders may arrive as full `From:` values; match them as bare addresses
    let responses = payload
        .responses
        .into_iter()
        .map(|r| Response {
            sender: extract_addresses(&r.sender)
                .into_iter()
                .next()
                .unwrap_or(r.sender),
            vote: r.vote,
        })
        .collect();
    let bundle = Bundle::new(request, extract_addresses(&payload.recipients), responses);
    commit_bundle(&state, bundle).await
}

/// POST /bundle/email: commit a bundle block pasted from a mail thread.
pub async fn close_request_from_email(
    State(state): State<AppState>,
    Json(payload): Json<BundleEmailInput>,
) -> Result<(StatusCode, Json<BundleOutput>), ApiError> {
    let bundle = Bundle::parse_from_email(&payload.text)
        .map_err(|e: MessageError| (StatusCode::BAD_REQUEST, e.to_string()))?;
    commit_bundle(&state, bundle).await
}

async fn commit_bundle(
    state: &AppState,
    bundle: Bundle,
) -> Result<(StatusCode, Json<BundleOutput>), ApiError> {
    if !bundle.verdict.is_final() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "voting is still pending".into(),
        ));
    }
    let tallied = Verdict::tally(&bundle.recipients, &bundle.responses);
    if tallied != bundle.verdict {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "stated verdict {} contradicts the responses, which tally to {tallied}",
                bundle.verdict
            ),
        ));
    }

    let block = {
        let mut guard = ledger(state);
        let opened = guard
            .chain()
            .find_request_block(&bundle.request.id)
            .ok_or((StatusCode::NOT_FOUND, "request not found".into()))?;
        if opened.request() != bundle.request {
            return Err((
                StatusCode::CONFLICT,
                "bundle does not match the request opened on the chain".into(),
            ));
        }

        let block = BundleBlock::new(&bundle, guard.chain().head().hash()).map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("bundle encoding failed: {e}"),
            )
        })?;
        guard
            .chain_mut()
            .try_append(block.clone())
            .map_err(rejected)?;
        block
    };
    let saved = save_committed(state).await;

    info!(request_id = %bundle.request.id, verdict = %bundle.verdict, saved, "Request closed");
    Ok((
        StatusCode::CREATED,
        Json(BundleOutput {
            block,
            verdict: bundle.verdict,
            email: bundle.format_as_email(),
            saved,
        }),
    ))
}

/// GET /blocks
pub async fn list_blocks(State(state): State<AppState>) -> Json<Vec<Block>> {
    let entries = ledger(&state).chain().entries().to_vec();
    Json(entries)
}

/// GET /block/:hash
pub async fn get_block(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Block>, ApiError> {
    let block = ledger(&state).chain().find_by_hash(&hash).cloned();
    block
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "not found".into()))
}

#[derive(Debug, Serialize)]
pub struct BundleView {
    pub block: BundleBlock,
    /// Decoded payload; absent if the stored payload is not a bundle.
    pub bundle: Option<Bundle>,
}

/// GET /bundle/:request_id
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<BundleView>, ApiError> {
    let block = ledger(&state)
        .chain()
        .find_bundle_block_by_request_id(&request_id)
        .cloned()
        .ok_or((StatusCode::NOT_FOUND, "not found".into()))?;
    let bundle = serde_json::from_str(&block.bundle_payload).ok();
    Ok(Json(BundleView { block, bundle }))
}

/// GET /validate: re-check linkage, hashes and uniqueness; returns { ok, errors[] }
#[derive(Debug, Serialize)]
pub struct ValidateResp {
    pub ok: bool,
    pub errors: Vec<String>,
}
pub async fn validate_chain(State(state): State<AppState>) -> Json<ValidateResp> {
    let errors = ledger(&state).chain().verify();
    Json(ValidateResp {
        ok: errors.is_empty(),
        errors,
    })
}

/// GET /health
#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub height: usize,
}
pub async fn health(State(state): State<AppState>) -> Json<Health> {
    let height = ledger(&state).chain().len();
    Json(Health {
        status: "ok",
        height,
    })
}

/// GET /version
#[derive(Serialize)]
pub struct Version {
    pub version: &'static str,
    pub git_sha: Option<&'static str>,
}
pub async fn version() -> Json<Version> {
    Json(Version {
        version: env!("CARGO_PKG_VERSION"),
        git_sha: option_env!("GIT_SHA"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::message::Vote;

    fn state(dir: &TempDir) -> AppState {
        let local = LocalChain::open(dir.path().join("chain.json")).expect("open");
        AppState::new(local, Duration::from_secs(5))
    }

    fn vote(sender: &str, vote: Vote) -> Response {
        Response {
            sender: sender.into(),
            vote,
        }
    }

    async fn open(state: &AppState, message: &str) -> RequestOutput {
        let (status, Json(out)) = open_request(
            State(state.clone()),
            Json(RequestInput {
                message: message.into(),
                action: default_action(),
            }),
        )
        .await
        .expect("open request");
        assert_eq!(status, StatusCode::CREATED);
        out
    }

    #[tokio::test]
    async fn opening_a_request_appends_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);

        let out = open(&state, "Move standup to 10:00").await;
        assert!(out.saved);
        assert_eq!(out.block.previous_hash, "genesis");
        assert_eq!(out.block.hash, out.block.request_id);
        assert_eq!(
            Request::parse_from_email(&out.email).unwrap(),
            out.block.request()
        );

        let on_disk = storage::load(&dir.path().join("chain.json"))
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk.head(), &Block::Request(out.block));
    }

    #[tokio::test]
    async fn multi_line_or_empty_messages_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);

        for message in ["", "   ", "line one\nline two"] {
            let (status, _) = open_request(
                State(state.clone()),
                Json(RequestInput {
                    message: message.into(),
                    action: default_action(),
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert_eq!(ledger(&state).chain().len(), 1);
    }

    #[tokio::test]
    async fn a_request_is_closed_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);
        let opened = open(&state, "Renew the build server").await;
        let request_id = opened.block.request_id.clone();

        let input = || BundleInput {
            request_id: request_id.clone(),
            recipients: r#""Alice" <alice@example.com>, bob@example.org"#.into(),
            responses: vec![
                vote("alice@example.com", Vote::Approve),
                vote("bob@example.org", Vote::Approve),
            ],
        };

        let (status, Json(closed)) = close_request(State(state.clone()), Json(input()))
            .await
            .expect("close");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(closed.verdict, Verdict::Accepted);
        assert_eq!(closed.block.previous_hash, request_id);

        let (status, _) = close_request(State(state.clone()), Json(input()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(ledger(&state).chain().len(), 3);

        let Json(view) = get_bundle(State(state.clone()), Path(request_id.clone()))
            .await
            .unwrap();
        let bundle = view.bundle.expect("payload decodes");
        assert_eq!(bundle.recipients, vec!["alice@example.com", "bob@example.org"]);
        assert_eq!(view.block, closed.block);

        let Json(report) = validate_chain(State(state.clone())).await;
        assert!(report.ok, "{:?}", report.errors);
    }

    #[tokio::test]
    async fn pending_and_unknown_requests_are_not_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);
        let opened = open(&state, "Switch coffee supplier").await;

        let (status, _) = close_request(
            State(state.clone()),
            Json(BundleInput {
                request_id: opened.block.request_id.clone(),
                recipients: "a@x.com, b@x.com".into(),
                responses: vec![vote("a@x.com", Vote::Approve)],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = close_request(
            State(state.clone()),
            Json(BundleInput {
                request_id: "unknown".into(),
                recipients: "a@x.com".into(),
                responses: vec![vote("a@x.com", Vote::Approve)],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(ledger(&state).chain().len(), 2);
    }

    #[tokio::test]
    async fn bundle_email_must_match_the_opened_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);
        let opened = open(&state, "Hire a second SRE").await;

        let mut forged = opened.block.request();
        forged.message = "Hire three SREs".into();
        let forged = Bundle::new(forged, vec!["a@x.com".into()], vec![vote("a@x.com", Vote::Approve)]);
        let (status, _) = close_request_from_email(
            State(state.clone()),
            Json(BundleEmailInput {
                text: forged.format_as_email(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        let genuine = Bundle::new(
            opened.block.request(),
            vec!["a@x.com".into()],
            vec![vote("a@x.com", Vote::Reject)],
        );
        let text = format!("Re: vote\n\n> {}", genuine.format_as_email().replace('\n', "\n> "));
        let (status, Json(closed)) = close_request_from_email(
            State(state.clone()),
            Json(BundleEmailInput { text }),
        )
        .await
        .expect("close from email");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(closed.verdict, Verdict::Rejected);

        let (status, _) = close_request_from_email(
            State(state.clone()),
            Json(BundleEmailInput {
                text: "no bundle here".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lookups_return_not_found_for_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);

        let Json(genesis) = get_block(State(state.clone()), Path("genesis".into()))
            .await
            .unwrap();
        assert_eq!(genesis.previous_hash(), "0");

        let (status, _) = get_block(State(state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_bundle(State(state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let Json(blocks) = list_blocks(State(state)).await;
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn persist_reports_unwritable_snapshot_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = LocalChain::open(dir.path().join("missing").join("chain.json")).unwrap();
        let state = AppState::new(local, Duration::from_secs(5));

        assert!(matches!(persist(&state).await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn timed_out_save_keeps_the_save_lock_until_the_write_ends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chain.json");
        let local = LocalChain::open(&path).expect("open");
        let state = AppState::new(local, Duration::ZERO);

        let result = persist(&state).await;
        assert!(matches!(result, Ok(()) | Err(StoreError::Timeout(_))), "{result:?}");

        // once the lock is free again the write has really finished
        let _done = state.save_lock.lock().await;
        assert!(path.exists());
        assert_eq!(storage::load(&path).unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn emailed_verdict_must_agree_with_the_responses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);
        let opened = open(&state, "Close the Friday deploy window").await;

        let contradicting = Bundle {
            request: opened.block.request(),
            recipients: vec!["a@x.com".into()],
            responses: vec![vote("a@x.com", Vote::Reject)],
            verdict: Verdict::Accepted,
        };
        let (status, message) = close_request_from_email(
            State(state.clone()),
            Json(BundleEmailInput {
                text: contradicting.format_as_email(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(message.contains("REJECTED"), "{message}");
        assert_eq!(ledger(&state).chain().len(), 2);
        assert!(ledger(&state)
            .chain()
            .find_bundle_block_by_request_id(&opened.block.request_id)
            .is_none());
    }

    #[tokio::test]
    async fn failed_save_still_returns_the_committed_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = LocalChain::open(dir.path().join("missing").join("chain.json")).unwrap();
        let state = AppState::new(local, Duration::from_secs(5));

        let out = open(&state, "Rotate the signing keys").await;
        assert!(!out.saved);
        assert_eq!(ledger(&state).chain().head(), &Block::Request(out.block.clone()));

        let (status, Json(closed)) = close_request(
            State(state.clone()),
            Json(BundleInput {
                request_id: out.block.request_id.clone(),
                recipients: "a@x.com".into(),
                responses: vec![vote("a@x.com", Vote::Approve)],
            }),
        )
        .await
        .expect("close");
        assert_eq!(status, StatusCode::CREATED);
        assert!(!closed.saved);
        assert_eq!(ledger(&state).chain().len(), 3);
    }

    #[tokio::test]
    async fn senders_with_display_names_still_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir);
        let opened = open(&state, "Adopt the new code of conduct").await;

        let (_, Json(closed)) = close_request(
            State(state.clone()),
            Json(BundleInput {
                request_id: opened.block.request_id.clone(),
                recipients: "alice@example.com, bob@example.org".into(),
                responses: vec![
                    vote(r#""Alice" <alice@example.com>"#, Vote::Approve),
                    vote("Bob <bob@example.org>", Vote::Approve),
                ],
            }),
        )
        .await
        .expect("close");
        assert_eq!(closed.verdict, Verdict::Accepted);

        let bundle = Bundle::parse_from_email(&closed.email).unwrap();
        assert_eq!(bundle.responses[0].sender, "alice@example.com");
    }
}
