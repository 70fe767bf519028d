//! Per-stage processing loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::invoker::Invoker;
use crate::error::{Error, Result};
use crate::flow::{Input, Output};
use crate::reflection::Rpc;

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    /// Input ended, message limit reached or stop requested.
    Completed,
    /// An invocation failed.
    Aborted,
}

/// Pulls states from a stage's input, invokes the stage's RPC and yields
/// the replies to its output, preserving the correlation id.
pub struct Worker {
    stage: String,
    rpc: Rpc,
    invoker: Arc<dyn Invoker>,
    input: Input,
    output: Output,
    timeout: Duration,
    max_messages: u64,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        stage: impl Into<String>,
        rpc: Rpc,
        invoker: Arc<dyn Invoker>,
        input: Input,
        output: Output,
    ) -> Self {
        Self {
            stage: stage.into(),
            rpc,
            invoker,
            input,
            output,
            timeout: Duration::from_secs(1),
            max_messages: 0,
            state: WorkerState::Created,
        }
    }

    /// Per-invocation deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop after this many successful invocations. 0 is unlimited.
    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Process until the input ends, the message limit is reached or
    /// `shutdown` flips to true. Returns the number of states processed.
    ///
    /// A stop request interrupts both the wait for input and an invocation
    /// in flight.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
        self.state = WorkerState::Running;
        info!(stage = %self.stage, rpc = %self.rpc.full_name(), "Worker started");

        let mut processed = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.max_messages > 0 && processed >= self.max_messages {
                debug!(stage = %self.stage, processed, "Message limit reached");
                break;
            }

            let state = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.input.next() => match next {
                    Some(state) => state,
                    None => break,
                },
            };

            let mut reply = self.rpc.output().new_instance();
            let call = self.invoker.invoke(&self.rpc, state.payload(), &mut reply);
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = tokio::time::timeout(self.timeout, call) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    self.output.yield_state(state.with_payload(reply));
                    processed += 1;
                }
                Ok(Err(e)) => return Err(self.abort(e, state.id())),
                Err(_) => {
                    let e = Error::unavailable(format!(
                        "{} timed out after {:?}",
                        self.rpc.full_name(),
                        self.timeout
                    ));
                    return Err(self.abort(e, state.id()));
                }
            }
        }

        self.state = WorkerState::Completed;
        info!(stage = %self.stage, processed, "Worker completed");
        Ok(processed)
    }

    fn abort(&mut self, error: Error, id: u64) -> Error {
        self.state = WorkerState::Aborted;
        error.context(format!("stage {} (state {})", self.stage, id))
    }

    /// Release the stage's flows.
    pub fn close(&self) {
        self.input.close();
        self.output.close();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("stage", &self.stage)
            .field("rpc", &self.rpc.full_name())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::flow::{Connection, SingleInput, SingleOutput, State};
    use crate::test_utils::{counter, counter_value, link, rpc, MockInvoker};

    fn flow(name: &str) -> Arc<Connection> {
        Arc::new(Connection::new(link(name, "a", "", "b", ""), 10).unwrap())
    }

    fn worker(invoker: MockInvoker, input: &Arc<Connection>, output: &Arc<Connection>) -> Worker {
        Worker::new(
            "inc",
            rpc("IncrementService", "Increment"),
            Arc::new(invoker),
            Input::Single(SingleInput::new(input.clone())),
            Output::Single(SingleOutput::new(output.clone())),
        )
    }

    #[tokio::test]
    async fn test_processes_until_input_closes() {
        let input = flow("in");
        let output = flow("out");
        input.push(State::new(7, counter(1, "x")));
        input.push(State::new(8, counter(5, "y")));
        input.close();

        let mut w = worker(MockInvoker::increment(), &input, &output);
        let (_tx, rx) = watch::channel(false);
        assert_eq!(w.run(rx).await.unwrap(), 2);
        assert_eq!(w.state(), WorkerState::Completed);

        let first = output.pop().await.unwrap();
        assert_eq!(first.id(), 7);
        assert_eq!(counter_value(first.payload()), 2);
        let second = output.pop().await.unwrap();
        assert_eq!(second.id(), 8);
        assert_eq!(counter_value(second.payload()), 6);
    }

    #[tokio::test]
    async fn test_max_messages() {
        let input = flow("in");
        let output = flow("out");
        for id in 1..=5 {
            input.push(State::new(id, counter(0, "")));
        }

        let mut w = worker(MockInvoker::increment(), &input, &output).with_max_messages(3);
        let (_tx, rx) = watch::channel(false);
        assert_eq!(w.run(rx).await.unwrap(), 3);
        assert_eq!(input.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_invocation_error_aborts() {
        let input = flow("in");
        let output = flow("out");
        input.push(State::new(1, counter(0, "")));

        let mut w = worker(
            MockInvoker::failing(Error::unknown("boom")),
            &input,
            &output,
        );
        let (_tx, rx) = watch::channel(false);
        let err = w.run(rx).await.unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        assert!(err.to_string().contains("stage inc"));
        assert_eq!(w.state(), WorkerState::Aborted);
        assert!(output.queue().is_empty());
    }

    #[tokio::test]
    async fn test_invocation_timeout_is_unavailable() {
        let input = flow("in");
        let output = flow("out");
        input.push(State::new(1, counter(0, "")));

        let mut w = worker(
            MockInvoker::increment().with_delay(Duration::from_secs(5)),
            &input,
            &output,
        )
        .with_timeout(Duration::from_millis(20));
        let (_tx, rx) = watch::channel(false);
        let err = w.run(rx).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_stop_interrupts_waiting_for_input() {
        let input = flow("in");
        let output = flow("out");
        let mut w = worker(MockInvoker::increment(), &input, &output);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let n = w.run(rx).await;
            (n, w.state())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let (n, state) = handle.await.unwrap();
        assert_eq!(n.unwrap(), 0);
        assert_eq!(state, WorkerState::Completed);
    }

    #[tokio::test]
    async fn test_stop_interrupts_invocation_in_flight() {
        let input = flow("in");
        let output = flow("out");
        input.push(State::new(1, counter(0, "")));
        let mut w = worker(
            MockInvoker::increment().with_delay(Duration::from_secs(30)),
            &input,
            &output,
        )
        .with_timeout(Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { w.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let n = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(output.queue().is_empty());
    }
}
