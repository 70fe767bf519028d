//! End-to-end pipelines over real tonic servers.

use std::sync::Arc;
use std::time::Duration;

use maestro::config::PipelineConfig;
use maestro::discovery::{find_rpc, Hints};
use maestro::domain::{Link, Phase};
use maestro::execution::{Execution, ExecutionConfig, GrpcDialer, GrpcInvoker, Worker};
use maestro::flow::{Connection, Input, Output, SingleInput, SingleOutput, State};
use maestro::grpc::connect_channel;
use maestro::pubsub::{PubSubConfig, Subscription};
use maestro::reflection::{ReflectionClient, Rpc};
use maestro::storage::MemoryRepository;
use maestro::test_utils::{counter, counter_value, serve_echo, serve_envelope, serve_increment};
use maestro::{Manager, StageSpec};
use tonic::transport::Channel;

async fn resolve(address: &str, hints: Hints) -> (Channel, Rpc) {
    let channel = connect_channel(address).await.unwrap();
    let rpc = find_rpc(&ReflectionClient::new(channel.clone()), &hints)
        .await
        .unwrap();
    (channel, rpc)
}

async fn wait_for_event(sub: &mut Subscription, description: &str) {
    if sub.history.iter().any(|e| e.description() == description) {
        return;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.future.recv().await {
            if event.description() == description {
                return;
            }
        }
        panic!("event stream ended before '{}'", description);
    })
    .await
    .unwrap_or_else(|_| panic!("no '{}' event", description));
}

/// feed -> A(echo) -> L -> B(increment) -> out
#[tokio::test]
async fn test_echo_then_increment_preserves_correlation_id() {
    let echo_server = serve_echo().await;
    let inc_server = serve_increment().await;
    let (echo_channel, echo_rpc) = resolve(&echo_server.address, Hints::default()).await;
    let (inc_channel, inc_rpc) = resolve(&inc_server.address, Hints::default()).await;

    let feed = Arc::new(Connection::new(Link::new("feed", "client", "a"), 10).unwrap());
    let l = Arc::new(Connection::between(Link::new("l", "a", "b"), &echo_rpc, &inc_rpc, 10).unwrap());
    let out = Arc::new(Connection::new(Link::new("out", "b", "client"), 10).unwrap());

    let workers = vec![
        Worker::new(
            "a",
            echo_rpc,
            Arc::new(GrpcInvoker::new(echo_channel)),
            Input::Single(SingleInput::new(feed.clone())),
            Output::Single(SingleOutput::new(l.clone())),
        ),
        Worker::new(
            "b",
            inc_rpc,
            Arc::new(GrpcInvoker::new(inc_channel)),
            Input::Single(SingleInput::new(l)),
            Output::Single(SingleOutput::new(out.clone())),
        ),
    ];
    let execution = Execution::new("e2e", workers, PubSubConfig::default());
    execution.start().await.unwrap();

    feed.push(State::new(1, counter(41, "msg-x")));

    let state = tokio::time::timeout(Duration::from_secs(5), out.pop())
        .await
        .expect("no state reached the end of the pipeline")
        .unwrap();
    assert_eq!(state.id(), 1);
    assert_eq!(counter_value(state.payload()), 42);
    assert_eq!(
        state.payload().get_field_by_name("label").unwrap().as_str(),
        Some("msg-x")
    );

    execution.stop().await.unwrap();
    assert!(execution.failed_stages().is_empty());
}

#[tokio::test]
async fn test_manager_runs_declared_pipeline() {
    let wrap_server = serve_envelope().await;
    let inc_server = serve_increment().await;

    let manager = Manager::new(Arc::new(MemoryRepository::new()), Arc::new(GrpcDialer::new(3)))
        .with_execution_config(ExecutionConfig {
            max_messages: 3,
            ..Default::default()
        });

    let pipeline = PipelineConfig {
        orchestration: "envelopes".to_string(),
        stages: vec![
            StageSpec::new("wrap", "", &wrap_server.address).with_rpc("Wrap"),
            StageSpec::new("inc", "", &inc_server.address),
        ],
        links: vec![Link::new("wrap-to-inc", "wrap", "inc").with_source_field("counter")],
        ..Default::default()
    };
    manager.apply_pipeline(&pipeline).await.unwrap();

    let inc = manager.get_stage("inc").await.unwrap();
    assert_eq!(inc.rpc.full_name(), "maestro.testing.IncrementService.Increment");

    manager.start_execution("envelopes").await.unwrap();
    let mut sub = manager.attach_execution("envelopes").await.unwrap();
    wait_for_event(&mut sub, "stage inc completed after 3 messages").await;
    manager
        .detach_execution("envelopes", sub.token)
        .await
        .unwrap();
    manager.stop_execution("envelopes").await.unwrap();

    let orchestration = manager.get_orchestration("envelopes").await.unwrap();
    assert_eq!(orchestration.phase, Phase::Succeeded);
    assert_eq!(orchestration.stages, vec!["wrap", "inc"]);
}

#[tokio::test]
async fn test_manager_rejects_incompatible_link_between_live_stages() {
    let wrap_server = serve_envelope().await;
    let inc_server = serve_increment().await;
    let manager = Manager::new(Arc::new(MemoryRepository::new()), Arc::new(GrpcDialer::new(3)));

    manager.create_orchestration("o").await.unwrap();
    manager
        .create_stage(StageSpec::new("wrap", "o", &wrap_server.address).with_rpc("Wrap"))
        .await
        .unwrap();
    manager
        .create_stage(StageSpec::new("inc", "o", &inc_server.address))
        .await
        .unwrap();

    // Envelope -> Counter without narrowing to the counter field.
    let err = manager
        .create_link(Link::new("wrap-to-inc", "wrap", "inc"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), maestro::error::Code::InvalidArgument);
}

#[tokio::test]
async fn test_create_stage_ambiguous_rpc() {
    let server = serve_envelope().await;
    let manager = Manager::new(Arc::new(MemoryRepository::new()), Arc::new(GrpcDialer::new(1)));
    manager.create_orchestration("o").await.unwrap();

    let err = manager
        .create_stage(StageSpec::new("env", "o", &server.address))
        .await
        .unwrap_err();
    assert_eq!(err.code(), maestro::error::Code::InvalidArgument);
    assert!(err.to_string().starts_with("stage env"));
    assert!(manager.get_stage("env").await.is_err());
}
