//! Process-wide notice sink.
//!
//! Notices are single-line JSON objects:
//!
//! ```text
//! {"noticeType":"Info","data":{"message":"..."},"timestamp":"2024-05-01T10:00:00.000Z"}
//! ```
//!
//! While an engine or feedback job is live the sink forwards to that
//! session's handler; otherwise notices go to stderr. Every notice is also
//! mirrored to `tracing`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::provider::NoticeHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeType {
    Info,
    Warning,
    Error,
    UserLog,
    BuildInfo,
    CandidateImport,
}

impl NoticeType {
    /// Diagnostic notices are only delivered when the config asks for them.
    pub fn is_diagnostic(self) -> bool {
        matches!(
            self,
            NoticeType::Info | NoticeType::Warning | NoticeType::Error | NoticeType::BuildInfo
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Notice<'a> {
    notice_type: NoticeType,
    data: &'a Value,
    timestamp: String,
}

/// Build identification reported by `BuildInfo` notices and `embed::build_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub package: &'static str,
    pub version: &'static str,
    pub target_os: &'static str,
    pub target_arch: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            package: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target_os: std::env::consts::OS,
            target_arch: std::env::consts::ARCH,
        }
    }
}

/// Routes notices to the handler of the active session.
#[derive(Default)]
pub struct NoticeSink {
    handler: RwLock<Option<Arc<dyn NoticeHandler>>>,
    emit_diagnostics: AtomicBool,
}

static GLOBAL_SINK: OnceLock<Arc<NoticeSink>> = OnceLock::new();

impl NoticeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sink shared by the embedding facade.
    pub fn global() -> Arc<NoticeSink> {
        GLOBAL_SINK.get_or_init(|| Arc::new(NoticeSink::new())).clone()
    }

    /// Forward notices to `handler` until [`NoticeSink::reset`].
    pub fn install(&self, handler: Arc<dyn NoticeHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_emit_diagnostics(&self, enabled: bool) {
        self.emit_diagnostics.store(enabled, Ordering::Release);
    }

    /// Restore the stderr writer and drop the reference to the old handler.
    pub fn reset(&self) {
        *self.handler.write() = None;
        self.emit_diagnostics.store(false, Ordering::Release);
    }

    pub fn is_default(&self) -> bool {
        self.handler.read().is_none()
    }

    pub fn emit(&self, notice_type: NoticeType, data: Value) {
        match notice_type {
            NoticeType::Error => error!(notice = ?notice_type, %data, "notice"),
            NoticeType::Warning => warn!(notice = ?notice_type, %data, "notice"),
            NoticeType::UserLog | NoticeType::CandidateImport => {
                info!(notice = ?notice_type, %data, "notice")
            }
            _ => debug!(notice = ?notice_type, %data, "notice"),
        }

        if notice_type.is_diagnostic() && !self.emit_diagnostics.load(Ordering::Acquire) {
            return;
        }

        let notice = Notice {
            notice_type,
            data: &data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let line = match serde_json::to_string(&notice) {
            Ok(line) => line,
            Err(e) => {
                warn!(%e, "failed to encode notice");
                return;
            }
        };

        // Never call out while holding the lock; the handler may be slow.
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.notice(&line),
            None => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.emit(NoticeType::Info, json!({ "message": message }));
    }

    pub fn warning(&self, message: &str) {
        self.emit(NoticeType::Warning, json!({ "message": message }));
    }

    pub fn error(&self, message: &str) {
        self.emit(NoticeType::Error, json!({ "message": message }));
    }

    pub fn user_log(&self, message: &str) {
        self.emit(NoticeType::UserLog, json!({ "message": message }));
    }

    pub fn build_info(&self) {
        match serde_json::to_value(BuildInfo::current()) {
            Ok(data) => self.emit(NoticeType::BuildInfo, data),
            Err(e) => warn!(%e, "failed to encode build info"),
        }
    }

    pub fn candidate_import(&self, stored: usize, skipped: usize, cancelled: bool) {
        self.emit(
            NoticeType::CandidateImport,
            json!({ "stored": stored, "skipped": skipped, "cancelled": cancelled }),
        );
    }
}
