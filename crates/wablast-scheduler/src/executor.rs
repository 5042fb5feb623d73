//! Send executor: one contact, one message, bounded retries.
//!
//! Only transient failures are retried, in place, with exponential backoff.
//! The executor never touches the store; the caller decides what an outcome
//! means for the campaign.

use std::sync::Arc;
use std::time::Duration;

use wablast_core::config::DispatchConfig;
use wablast_core::traits::MessagingGateway;
use wablast_core::types::{CampaignKind, Contact, MediaPayload, SendError};

use crate::template;

/// Everything needed to message one contact.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    pub instance: &'a str,
    pub kind: CampaignKind,
    pub contact: &'a Contact,
    /// Text body, or caption when `media` is set.
    pub template: &'a str,
    pub media: Option<&'a MediaPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: String },
    /// Rejected for good; the contact counts as attempted.
    SkippedPermanent { reason: String },
    /// Retries exhausted; the contact is not counted and the job halts.
    SkippedTransient { reason: String },
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub outcome: SendOutcome,
    pub attempts: u32,
    /// Backoff slept before each retry, in order.
    pub backoffs: Vec<Duration>,
}

pub struct SendExecutor {
    gateway: Arc<dyn MessagingGateway>,
    policy: DispatchConfig,
}

impl SendExecutor {
    pub fn new(gateway: Arc<dyn MessagingGateway>, policy: DispatchConfig) -> Self {
        Self { gateway, policy }
    }

    pub async fn execute(&self, req: SendRequest<'_>) -> SendReport {
        let Some(address) = req.contact.address(req.kind) else {
            return SendReport {
                outcome: SendOutcome::SkippedPermanent {
                    reason: format!("invalid destination '{}'", req.contact.destination),
                },
                attempts: 0,
                backoffs: Vec::new(),
            };
        };

        let body = template::render(req.template, req.contact);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoffs = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.attempt_once(&req, &address, &body).await {
                Ok(message_id) => {
                    return SendReport {
                        outcome: SendOutcome::Sent { message_id },
                        attempts: attempt,
                        backoffs,
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::warn!("🚫 {} rejected: {}", address, error.message);
                return SendReport {
                    outcome: SendOutcome::SkippedPermanent { reason: error.message },
                    attempts: attempt,
                    backoffs,
                };
            }

            if attempt >= max_attempts {
                tracing::warn!("⚠️ {} failed after {} attempts: {}", address, attempt, error.message);
                return SendReport {
                    outcome: SendOutcome::SkippedTransient { reason: error.message },
                    attempts: attempt,
                    backoffs,
                };
            }

            let delay = self.policy.backoff_for(attempt);
            tracing::debug!(
                "🔁 {} attempt {}/{} failed ({}), retrying in {:?}",
                address,
                attempt,
                max_attempts,
                error.message,
                delay
            );
            tokio::time::sleep(delay).await;
            backoffs.push(delay);
        }
    }

    async fn attempt_once(
        &self,
        req: &SendRequest<'_>,
        address: &str,
        body: &str,
    ) -> Result<String, SendError> {
        let timeout = self.policy.request_timeout();
        let call = async {
            match req.media {
                Some(media) => {
                    self.gateway
                        .send_media(req.instance, address, media, body)
                        .await
                }
                None => self.gateway.send_text(req.instance, address, body).await,
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SendError::transient(format!("request timed out after {timeout:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use wablast_core::types::MediaType;

    /// Replays scripted results and records every call.
    #[derive(Default)]
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<String, SendError>>>,
        calls: Mutex<Vec<(String, String, String)>>,
        hang: bool,
    }

    impl ScriptedGateway {
        fn with(results: Vec<Result<String, SendError>>) -> Self {
            Self { script: Mutex::new(results.into()), ..Default::default() }
        }

        fn next(&self, kind: &str, to: &str, body: &str) -> Result<String, SendError> {
            self.calls.lock().unwrap().push((kind.into(), to.into(), body.into()));
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| Ok("id".into()))
        }
    }

    #[async_trait]
    impl MessagingGateway for ScriptedGateway {
        async fn send_text(&self, _: &str, to: &str, text: &str) -> Result<String, SendError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.next("text", to, text)
        }

        async fn send_media(
            &self,
            _: &str,
            to: &str,
            _: &MediaPayload,
            caption: &str,
        ) -> Result<String, SendError> {
            self.next("media", to, caption)
        }
    }

    fn policy() -> DispatchConfig {
        DispatchConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            backoff_multiplier: 2,
            request_timeout_ms: 50,
            instance_rate_limit_capacity: 1,
        }
    }

    fn request<'a>(contact: &'a Contact, media: Option<&'a MediaPayload>) -> SendRequest<'a> {
        SendRequest {
            instance: "sales",
            kind: CampaignKind::Individual,
            contact,
            template: "Hello {name}",
            media,
        }
    }

    #[tokio::test]
    async fn test_transient_then_success_backs_off_exponentially() {
        let gw = Arc::new(ScriptedGateway::with(vec![
            Err(SendError::transient("502")),
            Err(SendError::transient("timeout")),
            Ok("wamid.1".into()),
        ]));
        let exec = SendExecutor::new(gw.clone(), policy());
        let contact = Contact::new("5511999990000", "Ana");

        let report = exec.execute(request(&contact, None)).await;
        assert_eq!(report.outcome, SendOutcome::Sent { message_id: "wamid.1".into() });
        assert_eq!(report.attempts, 3);
        assert_eq!(report.backoffs, vec![Duration::from_millis(10), Duration::from_millis(20)]);
        assert_eq!(gw.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let gw = Arc::new(ScriptedGateway::with(vec![Err(SendError::permanent("not on whatsapp"))]));
        let exec = SendExecutor::new(gw.clone(), policy());
        let contact = Contact::new("5511999990000", "Ana");

        let report = exec.execute(request(&contact, None)).await;
        assert!(matches!(report.outcome, SendOutcome::SkippedPermanent { .. }));
        assert_eq!(report.attempts, 1);
        assert!(report.backoffs.is_empty());
    }

    #[tokio::test]
    async fn test_transient_exhausted() {
        let gw = Arc::new(ScriptedGateway::with(vec![
            Err(SendError::transient("503")),
            Err(SendError::transient("503")),
            Err(SendError::transient("503")),
        ]));
        let exec = SendExecutor::new(gw.clone(), policy());
        let contact = Contact::new("5511999990000", "Ana");

        let report = exec.execute(request(&contact, None)).await;
        assert!(matches!(report.outcome, SendOutcome::SkippedTransient { .. }));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.backoffs.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let gw = Arc::new(ScriptedGateway { hang: true, ..Default::default() });
        let mut p = policy();
        p.max_attempts = 2;
        let exec = SendExecutor::new(gw, p);
        let contact = Contact::new("5511999990000", "Ana");

        let report = exec.execute(request(&contact, None)).await;
        match report.outcome {
            SendOutcome::SkippedTransient { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_media_path_renders_caption() {
        let gw = Arc::new(ScriptedGateway::default());
        let exec = SendExecutor::new(gw.clone(), policy());
        let contact = Contact::new("+55 11 99999-0000", "Ana");
        let media = MediaPayload {
            media_type: MediaType::Image,
            source: "https://cdn.example.com/a.jpg".into(),
            mime_type: None,
            file_name: None,
            size_bytes: 1000,
        };

        let report = exec.execute(request(&contact, Some(&media))).await;
        assert!(matches!(report.outcome, SendOutcome::Sent { .. }));
        let calls = gw.calls.lock().unwrap();
        assert_eq!(calls[0], ("media".into(), "5511999990000".into(), "Hello Ana".into()));
    }

    #[tokio::test]
    async fn test_invalid_destination_skips_without_calling_gateway() {
        let gw = Arc::new(ScriptedGateway::default());
        let exec = SendExecutor::new(gw.clone(), policy());
        let contact = Contact::new("n/a", "Ana");

        let report = exec.execute(request(&contact, None)).await;
        assert!(matches!(report.outcome, SendOutcome::SkippedPermanent { .. }));
        assert_eq!(report.attempts, 0);
        assert!(gw.calls.lock().unwrap().is_empty());
    }
}
