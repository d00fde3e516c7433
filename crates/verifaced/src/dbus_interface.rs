use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Mutex;
use veriface_core::collector::CollectMode;
use veriface_core::matcher::{match_multiple, GallerySearch, MatchResult};
use veriface_core::Embedding;
use veriface_store::{IdentityStore, REQUIRED_DIRECTIONS};
use zbus::interface;

use crate::config::Config;
use crate::engine::{EngineHandle, SessionSpec};
use crate::rate_limiter::{AttemptOutcome, RateLimiter};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: IdentityStore,
    pub rate_limiter: RateLimiter,
}

/// D-Bus interface for the verification daemon.
///
/// Bus name: org.veriface.Verify1
/// Object path: /org/veriface/Verify1
pub struct VerifaceService {
    pub state: Arc<Mutex<AppState>>,
}

/// Caller-supplied liveness verdict attached to an image verification.
/// Kiosks that run the depth check locally send this so the daemon can
/// reject spoofed sessions without re-deriving liveness it has no depth
/// data for.
#[derive(serde::Deserialize)]
struct ClientLiveness {
    is_live: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Resolve the capture-session parameters for a verify call. Empty (or
/// "count") runs the default count-bounded session; "time" runs the
/// time-bounded recognition window instead.
fn session_spec(config: &Config, mode: &str) -> Result<SessionSpec, String> {
    let (mode, max_duration) = match mode {
        "" | "count" => (
            CollectMode::Count {
                target_frames: config.required_frames,
            },
            Duration::from_secs(config.count_cap_secs),
        ),
        "time" => (
            CollectMode::Time,
            Duration::from_secs(config.recognition_secs),
        ),
        other => return Err(format!("unknown collection mode: {other}")),
    };
    Ok(SessionSpec {
        mode,
        max_duration,
        live_ratio_threshold: config.live_ratio_threshold,
        liveness_threshold_mm: config.liveness_threshold_mm,
    })
}

/// Gallery identity keys are `{phone}_{name}`; phone numbers never contain
/// an underscore, so the first one splits the key.
fn split_identity_key(key: &str) -> (Option<String>, Option<String>) {
    match key.split_once('_') {
        Some((phone, name)) => (Some(phone.to_string()), Some(name.to_string())),
        None => (Some(key.to_string()), None),
    }
}

fn match_response(result: &MatchResult, extra: serde_json::Value) -> String {
    let (phone, name) = match result.identity_key.as_deref() {
        Some(key) => split_identity_key(key),
        None => (None, None),
    };
    let mut body = serde_json::json!({
        "matched": result.matched,
        "phone": phone,
        "name": name,
        "confidence": result.confidence,
        "matched_images_count": result.matched_images,
        "elapsed_ms": result.elapsed.as_millis() as u64,
        "reason": result.reason,
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            body.insert(k.clone(), v.clone());
        }
    }
    body.to_string()
}

fn no_match_response(reason: &str, extra: serde_json::Value) -> String {
    let mut body = serde_json::json!({
        "matched": false,
        "phone": null,
        "name": null,
        "confidence": 0.0,
        "matched_images_count": 0,
        "reason": reason,
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            body.insert(k.clone(), v.clone());
        }
    }
    body.to_string()
}

#[interface(name = "org.veriface.Verify1")]
impl VerifaceService {
    /// Register an identity from one image per required capture direction.
    ///
    /// `images_json` maps direction name to a base64-encoded image. All five
    /// directions must be present; registration is all-or-nothing.
    async fn register(
        &self,
        phone: &str,
        name: &str,
        images_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, "register requested");

        if phone.is_empty() || name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "phone and name must be non-empty".to_string(),
            ));
        }
        let images: HashMap<String, String> = serde_json::from_str(images_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad images payload: {e}")))?;

        let missing: Vec<&str> = REQUIRED_DIRECTIONS
            .iter()
            .filter(|d| !images.contains_key(**d))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "missing direction images: {}",
                missing.join(", ")
            )));
        }

        let (engine, store) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.store.clone())
        };

        // Analyze every image before writing anything, so a bad image fails
        // the whole registration instead of storing a partial identity.
        let mut embeddings: Vec<(&str, Embedding)> = Vec::with_capacity(REQUIRED_DIRECTIONS.len());
        for direction in REQUIRED_DIRECTIONS {
            let bytes = BASE64.decode(images[direction].as_bytes()).map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("direction {direction}: bad base64: {e}"))
            })?;
            let detections = engine.analyze(bytes).await.map_err(|e| {
                tracing::warn!(direction, error = %e, "register: analysis failed");
                zbus::fdo::Error::InvalidArgs(format!("direction {direction}: {e}"))
            })?;
            let Some(detection) = detections.into_iter().next() else {
                return Err(zbus::fdo::Error::InvalidArgs(format!(
                    "direction {direction}: no face detected"
                )));
            };
            let Some(embedding) = detection.embedding else {
                return Err(zbus::fdo::Error::Failed(format!(
                    "direction {direction}: analyzer produced no embedding"
                )));
            };
            embeddings.push((direction, embedding));
        }

        for (direction, embedding) in &embeddings {
            store
                .upsert(phone, name, direction, embedding)
                .await
                .map_err(|e| {
                    tracing::error!(direction, error = %e, "register: store write failed");
                    zbus::fdo::Error::Failed(e.to_string())
                })?;
        }

        tracing::info!(name, directions = embeddings.len(), "registered");
        Ok(serde_json::json!({
            "status": "success",
            "direction_count": embeddings.len(),
        })
        .to_string())
    }

    /// Verify whoever is in front of the camera against all registered
    /// identities. `client_id` names the calling terminal for rate limiting
    /// (empty means "default"); `mode` selects the session shape (empty or
    /// "count" for the frame-count session, "time" for the recognition
    /// window).
    ///
    /// A session that sees no face, fails liveness, or matches nobody is a
    /// normal negative outcome returned as `matched=false` with a reason;
    /// only sensor/engine failures surface as D-Bus errors.
    async fn verify(&self, client_id: &str, mode: &str) -> zbus::fdo::Result<String> {
        let client = if client_id.is_empty() {
            "default"
        } else {
            client_id
        };
        tracing::info!(client, mode, "verify requested");

        {
            let mut state = self.state.lock().await;
            state.rate_limiter.check(client).map_err(|e| {
                tracing::warn!(client, "verify: terminal locked out");
                zbus::fdo::Error::Failed(e.to_string())
            })?;
        }

        let (engine, store, spec, threshold, max_images) = {
            let state = self.state.lock().await;
            let spec = session_spec(&state.config, mode).map_err(zbus::fdo::Error::InvalidArgs)?;
            (
                state.engine.clone(),
                state.store.clone(),
                spec,
                state.config.similarity_threshold,
                state.config.max_images,
            )
        };

        // Engine errors (sensor failure, busy) do NOT count as rate-limit
        // failures — only a deliberate no-match or liveness rejection does.
        let outcome = engine.collect(spec).await.map_err(|e| {
            tracing::error!(error = %e, "verify: capture session failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        let session = serde_json::json!({
            "total_frames": outcome.summary.total_frames,
            "live_frames": outcome.summary.live_frames,
            "live_ratio": outcome.summary.live_ratio,
            "is_live": outcome.summary.is_live_session,
            "average_age": outcome.summary.average_age,
            "gender": outcome.summary.majority_gender,
        });

        if outcome.summary.no_face_detected() {
            tracing::info!(client, "verify: no face detected");
            return Ok(no_match_response("no face detected", session));
        }
        if !outcome.summary.is_live_session {
            tracing::warn!(
                client,
                live_ratio = outcome.summary.live_ratio,
                "verify: liveness check failed"
            );
            let mut state = self.state.lock().await;
            state
                .rate_limiter
                .record(client, AttemptOutcome::LivenessRejected);
            return Ok(no_match_response("liveness check failed", session));
        }

        let gallery = store.load_gallery().await.map_err(|e| {
            tracing::error!(error = %e, "verify: gallery load failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        if gallery.is_empty() {
            tracing::warn!("verify: no registered identities");
            return Ok(no_match_response("no registered identities", session));
        }

        let probes: Vec<Embedding> = outcome
            .samples
            .into_iter()
            .filter_map(|s| s.embedding)
            .collect();
        let search = GallerySearch::new(gallery, threshold);
        let result = match_multiple(&probes, &search, threshold, max_images);

        {
            let mut state = self.state.lock().await;
            let outcome = if result.matched {
                AttemptOutcome::Matched
            } else {
                AttemptOutcome::NoMatch
            };
            state.rate_limiter.record(client, outcome);
        }

        tracing::info!(
            client,
            matched = result.matched,
            confidence = result.confidence,
            identity = ?result.identity_key,
            "verify complete"
        );
        Ok(match_response(&result, session))
    }

    /// Verify a batch of still images (kiosks without a local depth sensor
    /// stream stills instead). `liveness_json` optionally carries the
    /// caller's own liveness verdict; a not-live verdict rejects up front.
    async fn verify_images(
        &self,
        images_json: &str,
        liveness_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!("verify_images requested");

        if !liveness_json.is_empty() {
            let client: ClientLiveness = serde_json::from_str(liveness_json).map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("bad liveness payload: {e}"))
            })?;
            if !client.is_live {
                tracing::warn!(reason = ?client.reason, "verify_images: client reported not live");
                return Ok(no_match_response(
                    "liveness rejected by client",
                    serde_json::json!({ "is_live": false }),
                ));
            }
        }

        let images: Vec<String> = serde_json::from_str(images_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad images payload: {e}")))?;

        let (engine, store, threshold, max_images) = {
            let state = self.state.lock().await;
            (
                state.engine.clone(),
                state.store.clone(),
                state.config.similarity_threshold,
                state.config.max_images,
            )
        };

        if images.len() > max_images {
            tracing::warn!(
                provided = images.len(),
                max_images,
                "verify_images: truncating to the first max_images images"
            );
        }

        // Per-image failures are skipped, not fatal — one blurry frame must
        // not sink a batch that still carries usable ones.
        let mut probes: Vec<Embedding> = Vec::new();
        for (index, image_b64) in images.iter().take(max_images).enumerate() {
            let Ok(bytes) = BASE64.decode(image_b64.as_bytes()) else {
                tracing::warn!(index, "verify_images: bad base64, image skipped");
                continue;
            };
            match engine.analyze(bytes).await {
                Ok(detections) => {
                    if let Some(embedding) = detections.into_iter().find_map(|d| d.embedding) {
                        probes.push(embedding);
                    }
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "verify_images: analysis failed, image skipped");
                }
            }
        }

        if probes.is_empty() {
            return Ok(no_match_response(
                "no faces detected in any image",
                serde_json::json!({}),
            ));
        }

        let gallery = store.load_gallery().await.map_err(|e| {
            tracing::error!(error = %e, "verify_images: gallery load failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        if gallery.is_empty() {
            return Ok(no_match_response(
                "no registered identities",
                serde_json::json!({}),
            ));
        }

        let search = GallerySearch::new(gallery, threshold);
        let result = match_multiple(&probes, &search, threshold, max_images);
        tracing::info!(
            matched = result.matched,
            confidence = result.confidence,
            images = probes.len(),
            "verify_images complete"
        );
        Ok(match_response(&result, serde_json::json!({})))
    }

    /// Report which capture directions an identity has registered.
    async fn check_registration(&self, phone: &str, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "check_registration requested");
        let store = self.state.lock().await.store.clone();
        let status = store
            .check_registration(phone, name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Delete every record for an identity. Returns the number removed.
    async fn delete_user(&self, phone: &str, name: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(name, "delete_user requested");
        let store = self.state.lock().await.store.clone();
        let removed = store
            .delete_identity(phone, name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed == 0 {
            tracing::warn!(name, "delete_user: identity not found");
        }
        Ok(removed as u32)
    }

    /// List registered identities with their direction coverage as JSON.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let users = store
            .list_users()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&users).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Encrypt legacy plaintext identity fields. With `dry_run` the pass
    /// reports what it would do without writing.
    async fn migrate_legacy(&self, dry_run: bool) -> zbus::fdo::Result<String> {
        tracing::info!(dry_run, "migrate_legacy requested");
        let store = self.state.lock().await.store.clone();
        let stats = store
            .migrate_legacy(dry_run)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&stats).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let record_count = state.store.count_all().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "records": record_count,
            "similarity_threshold": state.config.similarity_threshold,
            "required_frames": state.config.required_frames,
            "live_ratio_threshold": state.config.live_ratio_threshold,
            "liveness_threshold_mm": state.config.liveness_threshold_mm,
        })
        .to_string())
    }

    /// Liveness probe for callers holding a long-lived connection.
    async fn ping(&self) -> String {
        "pong".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            db_path: "/tmp/veriface-test.db".into(),
            field_secret: "secret".into(),
            field_secret_from_env: true,
            replay_dir: None,
            similarity_threshold: 0.7,
            required_frames: 10,
            live_ratio_threshold: 0.9,
            count_cap_secs: 2,
            recognition_secs: 3,
            liveness_threshold_mm: 10.0,
            max_images: 5,
            max_failures: 5,
            failure_window_secs: 60,
            lockout_secs: 300,
            session_bus: true,
        }
    }

    #[test]
    fn test_session_spec_defaults_to_count_mode() {
        let config = test_config();
        for mode in ["", "count"] {
            let spec = session_spec(&config, mode).unwrap();
            assert_eq!(spec.mode, CollectMode::Count { target_frames: 10 });
            assert_eq!(spec.max_duration, Duration::from_secs(2));
        }
    }

    #[test]
    fn test_session_spec_time_mode_uses_recognition_window() {
        let config = test_config();
        let spec = session_spec(&config, "time").unwrap();
        assert_eq!(spec.mode, CollectMode::Time);
        assert_eq!(spec.max_duration, Duration::from_secs(3));
    }

    #[test]
    fn test_session_spec_rejects_unknown_mode() {
        assert!(session_spec(&test_config(), "forever").is_err());
    }

    #[test]
    fn test_split_identity_key() {
        assert_eq!(
            split_identity_key("010-1234-5678_김주찬"),
            (
                Some("010-1234-5678".to_string()),
                Some("김주찬".to_string())
            )
        );
        // A name with an underscore stays intact
        assert_eq!(
            split_identity_key("01012345678_a_b"),
            (Some("01012345678".to_string()), Some("a_b".to_string()))
        );
        assert_eq!(
            split_identity_key("no-separator"),
            (Some("no-separator".to_string()), None)
        );
    }

    #[test]
    fn test_match_response_shape() {
        let result = MatchResult {
            matched: true,
            identity_key: Some("010-1234-5678_alice".to_string()),
            confidence: 0.91,
            matched_images: 7,
            elapsed: Duration::from_millis(42),
            reason: None,
        };
        let body: serde_json::Value =
            serde_json::from_str(&match_response(&result, serde_json::json!({"is_live": true})))
                .unwrap();
        assert_eq!(body["matched"], true);
        assert_eq!(body["phone"], "010-1234-5678");
        assert_eq!(body["name"], "alice");
        assert_eq!(body["matched_images_count"], 7);
        assert_eq!(body["elapsed_ms"], 42);
        assert_eq!(body["is_live"], true);
        assert!(body["reason"].is_null());
    }

    #[test]
    fn test_no_match_response_shape() {
        let body: serde_json::Value = serde_json::from_str(&no_match_response(
            "liveness check failed",
            serde_json::json!({"live_ratio": 0.4}),
        ))
        .unwrap();
        assert_eq!(body["matched"], false);
        assert_eq!(body["reason"], "liveness check failed");
        assert_eq!(body["live_ratio"], 0.4);
        assert!(body["phone"].is_null());
    }
}
