use crate::error::VerifyError;
use crate::redfish::{PowerActionRequest, PowerExecutor};
use crate::types::PowerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Polls a node's live power state until it matches the operation's
/// expected state or the verification window expires.
pub struct ExpectedStateReader {
    executor: Arc<dyn PowerExecutor>,
    poll: Duration,
    window: Duration,
}

impl ExpectedStateReader {
    pub fn new(executor: Arc<dyn PowerExecutor>, poll: Duration, window: Duration) -> Self {
        Self {
            executor,
            poll,
            window,
        }
    }

    /// `Ok(Some(state))` once the expected state is observed, `Ok(None)` for
    /// operations that are not verified (nmi). Retryable read errors are
    /// swallowed and retried on the next poll; terminal ones abort.
    pub async fn await_expected_state(
        &self,
        request: &PowerActionRequest,
    ) -> Result<Option<PowerState>, VerifyError> {
        let Some(expected) = request.operation.expected_power_state() else {
            return Ok(None);
        };

        let deadline = Instant::now() + self.window;
        loop {
            match self.executor.read_power_state(request).await {
                Ok(observed) if observed == expected => return Ok(Some(observed)),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(VerifyError::Read(e)),
            }

            if Instant::now() + self.poll > deadline {
                return Err(VerifyError::Timeout {
                    window_ms: self.window.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::types::{BmcCredential, PowerOperation};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves a scripted sequence of read results, repeating the last one.
    struct ScriptedReads {
        script: Mutex<Vec<Result<PowerState, ExecutionError>>>,
    }

    impl ScriptedReads {
        fn new(script: Vec<Result<PowerState, ExecutionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl PowerExecutor for ScriptedReads {
        async fn execute_power_action(
            &self,
            _request: &PowerActionRequest,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }

        async fn read_power_state(
            &self,
            _request: &PowerActionRequest,
        ) -> Result<PowerState, ExecutionError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn request(operation: PowerOperation) -> PowerActionRequest {
        PowerActionRequest {
            endpoint: "https://10.1.0.10".into(),
            node_id: "node-a".into(),
            operation,
            credential: BmcCredential {
                username: "root".into(),
                password: "pw".into(),
            },
            insecure_skip_verify: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_state_matches() {
        let executor = ScriptedReads::new(vec![
            Ok(PowerState::PoweringOn),
            Ok(PowerState::PoweringOn),
            Ok(PowerState::On),
        ]);
        let reader = ExpectedStateReader::new(
            executor,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        let observed = reader
            .await_expected_state(&request(PowerOperation::On))
            .await
            .unwrap();
        assert_eq!(observed, Some(PowerState::On));
    }

    #[tokio::test]
    async fn nmi_is_not_verified() {
        let executor = ScriptedReads::new(vec![Ok(PowerState::Off)]);
        let reader = ExpectedStateReader::new(
            executor,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        let observed = reader
            .await_expected_state(&request(PowerOperation::Nmi))
            .await
            .unwrap();
        assert_eq!(observed, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_read_errors_are_swallowed() {
        let executor = ScriptedReads::new(vec![
            Err(ExecutionError::http(503, "busy")),
            Err(ExecutionError::transport("connection reset")),
            Ok(PowerState::Off),
        ]);
        let reader = ExpectedStateReader::new(
            executor,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        let observed = reader
            .await_expected_state(&request(PowerOperation::Off))
            .await
            .unwrap();
        assert_eq!(observed, Some(PowerState::Off));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_read_error_aborts() {
        let executor = ScriptedReads::new(vec![Err(ExecutionError::http(401, "nope"))]);
        let reader = ExpectedStateReader::new(
            executor,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        let err = reader
            .await_expected_state(&request(PowerOperation::Off))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Read(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_times_out() {
        let executor = ScriptedReads::new(vec![Ok(PowerState::PoweringOff)]);
        let reader = ExpectedStateReader::new(
            executor,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );

        let err = reader
            .await_expected_state(&request(PowerOperation::Off))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Timeout { window_ms: 500 }));
    }
}
