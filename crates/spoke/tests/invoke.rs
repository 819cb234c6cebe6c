//! Integration tests for channels and remotes across a live fabric.

mod common;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{WAIT, join, start_server};
use serde::{Deserialize, Serialize};
use spoke::prelude::*;
use tokio::sync::mpsc;

// =========================================================================
// Contracts
// =========================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum ChatCall {
    Said { from: String, text: String },
}

fn said(from: &str, text: &str) -> ChatCall {
    ChatCall::Said {
        from: from.into(),
        text: text.into(),
    }
}

struct Chat;

impl ChannelContract for Chat {
    const NAME: &'static str = "chat";
    type Call = ChatCall;

    fn method(_: &ChatCall) -> &'static str {
        "said"
    }
}

/// A different channel contract, for mismatch checks.
struct Ticker;

impl ChannelContract for Ticker {
    const NAME: &'static str = "ticker";
    type Call = u32;

    fn method(_: &u32) -> &'static str {
        "tick"
    }
}

/// Forwards every chat call to a test channel.
struct Collect(mpsc::UnboundedSender<ChatCall>);

impl ChannelSubscriber<Chat> for Collect {
    fn on_call(&self, call: ChatCall) {
        let _ = self.0.send(call);
    }
}

fn collector() -> (Arc<Collect>, mpsc::UnboundedReceiver<ChatCall>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collect(tx)), rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<ChatCall>) -> ChatCall {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a chat call")
        .expect("subscriber dropped")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<ChatCall>) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "unexpected chat call");
}

#[derive(Debug, Serialize, Deserialize)]
enum CalcCall {
    Sum(Vec<i64>),
    Reverse(String),
    Scale { values: Vec<f64>, by: f64 },
    Negate(bool),
    Divide(i32, i32),
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
enum CalcReply {
    Int(i64),
    Text(String),
    Floats(Vec<f64>),
    Flag(bool),
    Quotient(i32),
}

struct Calc;

impl RemoteContract for Calc {
    const NAME: &'static str = "calc";
    type Call = CalcCall;
    type Reply = CalcReply;

    fn method(call: &CalcCall) -> &'static str {
        match call {
            CalcCall::Sum(_) => "sum",
            CalcCall::Reverse(_) => "reverse",
            CalcCall::Scale { .. } => "scale",
            CalcCall::Negate(_) => "negate",
            CalcCall::Divide(..) => "divide",
        }
    }
}

struct Calculator;

impl RemoteImplementor<Calc> for Calculator {
    async fn invoke(&self, call: CalcCall) -> Result<CalcReply, RemoteFailure> {
        Ok(match call {
            CalcCall::Sum(values) => CalcReply::Int(values.iter().sum()),
            CalcCall::Reverse(text) => CalcReply::Text(text.chars().rev().collect()),
            CalcCall::Scale { values, by } => {
                CalcReply::Floats(values.into_iter().map(|v| v * by).collect())
            }
            CalcCall::Negate(flag) => CalcReply::Flag(!flag),
            CalcCall::Divide(_, 0) => return Err(RemoteFailure::new("division by zero")),
            CalcCall::Divide(a, b) => CalcReply::Quotient(a / b),
        })
    }
}

/// Never answers.
struct Stall;

impl RemoteImplementor<Calc> for Stall {
    async fn invoke(&self, _call: CalcCall) -> Result<CalcReply, RemoteFailure> {
        std::future::pending().await
    }
}

/// Stalls on `Sum`, answers everything else like [`Calculator`].
struct StallOnSum;

impl RemoteImplementor<Calc> for StallOnSum {
    async fn invoke(&self, call: CalcCall) -> Result<CalcReply, RemoteFailure> {
        match call {
            CalcCall::Sum(_) => std::future::pending().await,
            other => Calculator.invoke(other).await,
        }
    }
}

/// Answers `Sum` by calling its own remote for a `Negate`.
struct CallsItself(OnceLock<RemoteProxy<Calc, ServerMessenger>>);

impl RemoteImplementor<Calc> for CallsItself {
    async fn invoke(&self, call: CalcCall) -> Result<CalcReply, RemoteFailure> {
        match call {
            CalcCall::Negate(flag) => Ok(CalcReply::Flag(!flag)),
            _ => {
                let proxy = self
                    .0
                    .get()
                    .ok_or_else(|| RemoteFailure::new("proxy not set"))?;
                proxy
                    .call(CalcCall::Negate(true))
                    .await
                    .map_err(|e| RemoteFailure::new(e.to_string()))
            }
        }
    }
}

async fn unified<M: Messenger>(messenger: &M) -> UnifiedMessenger<M> {
    UnifiedMessenger::new(messenger.clone(), InvokeConfig::default())
        .await
        .expect("registry should sync")
}

// =========================================================================
// Remotes
// =========================================================================

#[tokio::test]
async fn test_remote_round_trip_from_client_to_server() {
    let server = start_server().await;
    let host = RemoteMessenger::new(unified(&server).await);
    host.register_remote::<Calc, _>(Arc::new(Calculator), "calc")
        .unwrap();

    let client = join(&server, "alice").await;
    let remotes = RemoteMessenger::new(unified(&client).await);
    assert!(remotes.has_implementor("calc"));
    let calc = remotes.remote::<Calc>("calc").unwrap();

    assert_eq!(
        calc.call(CalcCall::Sum(vec![1, 2, 3, -10])).await.unwrap(),
        CalcReply::Int(-4)
    );
    assert_eq!(
        calc.call(CalcCall::Sum(vec![])).await.unwrap(),
        CalcReply::Int(0)
    );
    assert_eq!(
        calc.call(CalcCall::Reverse("héllo wörld".into())).await.unwrap(),
        CalcReply::Text("dlröw olléh".into())
    );
    assert_eq!(
        calc.call(CalcCall::Scale {
            values: vec![0.5, 1.5, -2.0],
            by: 2.0
        })
        .await
        .unwrap(),
        CalcReply::Floats(vec![1.0, 3.0, -4.0])
    );
    assert_eq!(
        calc.call(CalcCall::Negate(false)).await.unwrap(),
        CalcReply::Flag(true)
    );
}

#[tokio::test]
async fn test_remote_failure_is_raised_at_the_caller() {
    let server = start_server().await;
    let host = RemoteMessenger::new(unified(&server).await);
    host.register_remote::<Calc, _>(Arc::new(Calculator), "calc")
        .unwrap();

    let client = join(&server, "alice").await;
    let calc = RemoteMessenger::new(unified(&client).await)
        .remote::<Calc>("calc")
        .unwrap();

    match calc.call(CalcCall::Divide(1, 0)).await {
        Err(InvokeError::Remote(failure)) => assert_eq!(failure.message, "division by zero"),
        other => panic!("expected a remote failure, got {other:?}"),
    }
    // The implementor is still there afterwards.
    assert_eq!(
        calc.call(CalcCall::Divide(9, 3)).await.unwrap(),
        CalcReply::Quotient(3)
    );
}

#[tokio::test]
async fn test_local_remote_runs_in_process() {
    let server = start_server().await;
    let remotes = RemoteMessenger::new(unified(&server).await);
    remotes
        .register_remote::<Calc, _>(Arc::new(Calculator), "calc")
        .unwrap();

    let calc = remotes.remote::<Calc>("calc").unwrap();
    assert_eq!(
        calc.call(CalcCall::Sum(vec![40, 2])).await.unwrap(),
        CalcReply::Int(42)
    );
}

#[tokio::test]
async fn test_client_hosted_remote_is_reachable_from_other_client() {
    let server = start_server().await;
    let _host = unified(&server).await;
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let at_alice = RemoteMessenger::new(unified(&alice).await);
    let at_bob = RemoteMessenger::new(unified(&bob).await);

    at_alice
        .register_remote::<Calc, _>(Arc::new(Calculator), "alice.calc")
        .unwrap();
    at_bob
        .wait_for_remote("alice.calc", Some(WAIT))
        .await
        .unwrap();

    let calc = at_bob.remote::<Calc>("alice.calc").unwrap();
    assert_eq!(
        calc.call(CalcCall::Reverse("abc".into())).await.unwrap(),
        CalcReply::Text("cba".into())
    );
}

#[tokio::test]
async fn test_second_local_implementor_is_refused() {
    let server = start_server().await;
    let remotes = RemoteMessenger::new(unified(&server).await);
    remotes
        .register_remote::<Calc, _>(Arc::new(Calculator), "calc")
        .unwrap();

    let again = remotes.register_remote::<Calc, _>(Arc::new(Calculator), "calc");
    assert!(matches!(again, Err(InvokeError::AlreadyRegistered(ref n)) if n == "calc"));

    assert!(remotes.unregister_remote("calc"));
    assert!(!remotes.has_implementor("calc"));
    let calc = remotes.remote::<Calc>("calc").unwrap();
    assert!(matches!(
        calc.call(CalcCall::Sum(vec![1])).await,
        Err(InvokeError::RemoteNotFound(_))
    ));
}

#[tokio::test]
async fn test_pending_call_fails_when_implementor_leaves() {
    let server = start_server().await;
    let _host = unified(&server).await;
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let at_alice = RemoteMessenger::new(unified(&alice).await);
    let at_bob = RemoteMessenger::new(unified(&bob).await);
    at_alice
        .register_remote::<Calc, _>(Arc::new(Stall), "stall")
        .unwrap();
    at_bob.wait_for_remote("stall", Some(WAIT)).await.unwrap();

    let proxy = at_bob.remote::<Calc>("stall").unwrap();
    let call = tokio::spawn(async move { proxy.call(CalcCall::Sum(vec![1])).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.shutdown();

    let result = tokio::time::timeout(WAIT, call)
        .await
        .expect("call must not hang")
        .unwrap();
    assert!(matches!(result, Err(InvokeError::ConnectionLost(_))));
    assert!(!at_bob.has_implementor("stall"));
}

#[tokio::test]
async fn test_call_timeout_bounds_a_stalled_call() {
    let server = start_server().await;
    let host = RemoteMessenger::new(unified(&server).await);
    host.register_remote::<Calc, _>(Arc::new(Stall), "stall")
        .unwrap();

    let client = join(&server, "alice").await;
    let config = InvokeConfig {
        call_timeout: Some(Duration::from_millis(100)),
        ..InvokeConfig::default()
    };
    let remotes = RemoteMessenger::new(
        UnifiedMessenger::new(client.clone(), config).await.unwrap(),
    );
    let proxy = remotes.remote::<Calc>("stall").unwrap();

    assert!(matches!(
        proxy.call(CalcCall::Sum(vec![])).await,
        Err(InvokeError::Timeout)
    ));
}

#[tokio::test]
async fn test_stalled_call_does_not_hold_up_other_callers() {
    let server = start_server().await;
    let host = RemoteMessenger::new(unified(&server).await);
    host.register_remote::<Calc, _>(Arc::new(StallOnSum), "calc")
        .unwrap();

    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let at_alice = RemoteMessenger::new(unified(&alice).await);
    let at_bob = RemoteMessenger::new(unified(&bob).await);

    let stalled = at_alice.remote::<Calc>("calc").unwrap();
    let _stalled = tokio::spawn(async move { stalled.call(CalcCall::Sum(vec![1])).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calc = at_bob.remote::<Calc>("calc").unwrap();
    let reply = tokio::time::timeout(WAIT, calc.call(CalcCall::Negate(true)))
        .await
        .expect("bob's call must not wait behind alice's");
    assert_eq!(reply.unwrap(), CalcReply::Flag(false));
}

#[tokio::test]
async fn test_implementor_can_call_its_own_remote() {
    let server = start_server().await;
    let host = RemoteMessenger::new(unified(&server).await);
    let implementor = Arc::new(CallsItself(OnceLock::new()));
    host.register_remote::<Calc, _>(Arc::clone(&implementor), "calc")
        .unwrap();
    let _ = implementor.0.set(host.remote::<Calc>("calc").unwrap());

    let client = join(&server, "alice").await;
    let calc = RemoteMessenger::new(unified(&client).await)
        .remote::<Calc>("calc")
        .unwrap();

    let reply = tokio::time::timeout(WAIT, calc.call(CalcCall::Sum(vec![])))
        .await
        .expect("a call back into the same remote must complete");
    assert_eq!(reply.unwrap(), CalcReply::Flag(false));
}

// =========================================================================
// Channels
// =========================================================================

#[tokio::test]
async fn test_channel_fan_out_keeps_sender_order() {
    let server = start_server().await;
    let at_host = ChannelMessenger::new(unified(&server).await);
    at_host.create_channel::<Chat>("lobby").unwrap();

    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let at_alice = ChannelMessenger::new(unified(&alice).await);
    let at_bob = ChannelMessenger::new(unified(&bob).await);

    let (host_sub, mut host_rx) = collector();
    let (alice_sub, mut alice_rx) = collector();
    let (bob_sub, mut bob_rx) = collector();
    at_host.register_subscriber::<Chat, _>(host_sub, "lobby").unwrap();
    at_alice.register_subscriber::<Chat, _>(alice_sub, "lobby").unwrap();
    at_bob.register_subscriber::<Chat, _>(bob_sub, "lobby").unwrap();
    assert_eq!(at_bob.local_subscriber_count("lobby"), 1);

    let lobby = at_bob.broadcaster::<Chat>("lobby").unwrap();
    for n in 0..25 {
        lobby.call(said("bob", &n.to_string())).unwrap();
    }

    for rx in [&mut bob_rx, &mut alice_rx, &mut host_rx] {
        for n in 0..25 {
            assert_eq!(recv(rx).await, said("bob", &n.to_string()));
        }
    }
}

#[tokio::test]
async fn test_unsubscribed_subscriber_hears_nothing() {
    let server = start_server().await;
    let channels = ChannelMessenger::new(unified(&server).await);
    channels.create_channel::<Chat>("lobby").unwrap();

    let (sub, mut rx) = collector();
    channels
        .register_subscriber::<Chat, _>(Arc::clone(&sub), "lobby")
        .unwrap();
    assert!(channels.unregister_subscriber(&sub, "lobby"));
    assert!(!channels.unregister_subscriber(&sub, "lobby"));

    channels
        .broadcaster::<Chat>("lobby")
        .unwrap()
        .call(said("host", "anyone?"))
        .unwrap();
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_unknown_or_mismatched_names_fail_fast() {
    let server = start_server().await;
    let unified = unified(&server).await;
    let channels = ChannelMessenger::new(unified.clone());
    let remotes = RemoteMessenger::new(unified);

    assert!(matches!(
        channels.broadcaster::<Chat>("nowhere"),
        Err(InvokeError::UnknownEndpoint(_))
    ));
    let (sub, _rx) = collector();
    assert!(matches!(
        channels.register_subscriber::<Chat, _>(sub, "nowhere"),
        Err(InvokeError::UnknownEndpoint(_))
    ));

    channels.create_channel::<Chat>("lobby").unwrap();
    assert!(matches!(
        channels.broadcaster::<Ticker>("lobby"),
        Err(InvokeError::ContractMismatch { .. })
    ));
    assert!(matches!(
        remotes.remote::<Calc>("lobby"),
        Err(InvokeError::ContractMismatch { .. })
    ));
}

#[tokio::test]
async fn test_recreating_a_channel() {
    let server = start_server().await;
    let channels = ChannelMessenger::new(unified(&server).await);

    channels.create_channel::<Chat>("lobby").unwrap();
    channels.create_channel::<Chat>("lobby").unwrap();
    assert!(matches!(
        channels.create_channel::<Ticker>("lobby"),
        Err(InvokeError::EndpointMismatch(_))
    ));

    assert!(channels.destroy_channel("lobby"));
    assert!(!channels.has_channel("lobby"));
    channels.create_channel::<Ticker>("lobby").unwrap();
}

#[tokio::test]
async fn test_wait_for_channel_created_elsewhere() {
    let server = start_server().await;
    let at_host = ChannelMessenger::new(unified(&server).await);
    let alice = join(&server, "alice").await;
    let at_alice = ChannelMessenger::new(unified(&alice).await);

    assert!(!at_alice.has_channel("late"));
    let waiter = {
        let at_alice = at_alice.clone();
        tokio::spawn(async move { at_alice.wait_for_channel("late", Some(WAIT)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    at_host.create_channel::<Chat>("late").unwrap();

    waiter.await.unwrap().unwrap();
    assert!(at_alice.has_channel("late"));

    assert!(matches!(
        at_alice
            .wait_for_channel("never", Some(Duration::from_millis(100)))
            .await,
        Err(InvokeError::Timeout)
    ));
}

// =========================================================================
// Chat moderation
// =========================================================================

#[tokio::test]
async fn test_muted_chat_is_replaced_by_a_notice_until_expiry() {
    let server = start_server().await;
    let at_host = ChannelMessenger::new(unified(&server).await);
    at_host.create_channel::<Chat>("chat").unwrap();
    server
        .enable_chat_muting::<Chat>("chat", &said("host", "you are muted"))
        .unwrap();

    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let at_alice = ChannelMessenger::new(unified(&alice).await);
    let at_bob = ChannelMessenger::new(unified(&bob).await);

    let (alice_sub, mut alice_rx) = collector();
    let (bob_sub, mut bob_rx) = collector();
    let (host_sub, mut host_rx) = collector();
    at_alice.register_subscriber::<Chat, _>(alice_sub, "chat").unwrap();
    at_bob.register_subscriber::<Chat, _>(bob_sub, "chat").unwrap();
    at_host.register_subscriber::<Chat, _>(host_sub, "chat").unwrap();

    server.moderation().mute_username(
        "alice",
        Some(tokio::time::Instant::now() + Duration::from_millis(400)),
    );
    let chat = at_alice.broadcaster::<Chat>("chat").unwrap();
    chat.call(said("alice", "spam")).unwrap();

    // alice's own subscriber runs locally, then the server's notice arrives.
    assert_eq!(recv(&mut alice_rx).await, said("alice", "spam"));
    assert_eq!(recv(&mut alice_rx).await, said("host", "you are muted"));
    assert_silent(&mut bob_rx).await;
    assert_silent(&mut host_rx).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!server.moderation().is_username_muted("alice"));

    chat.call(said("alice", "sorry")).unwrap();
    assert_eq!(recv(&mut bob_rx).await, said("alice", "sorry"));
    assert_eq!(recv(&mut host_rx).await, said("alice", "sorry"));
}

/// Connects with the given password and hardware address.
async fn join_as(
    server: &ServerMessenger,
    name: &str,
    password: Option<&str>,
    hardware_address: &str,
) -> ClientMessenger {
    let mut builder = ClientMessenger::builder("127.0.0.1", server.local_addr().port(), name)
        .hardware_address(hardware_address);
    if let Some(password) = password {
        builder = builder.credentials(PasswordCredentials::new(password));
    }
    builder.connect().await.expect("client should connect")
}

/// Mutes `hardware_address`, then checks alice's chat comes back as the
/// notice while bob hears nothing.
async fn assert_muted_by_hardware(password: Option<&str>) {
    let mut builder = ServerMessenger::builder().name("host");
    if let Some(password) = password {
        builder = builder.login_validator(PasswordValidator::new(password));
    }
    let server = builder.build().await.unwrap();
    let at_host = ChannelMessenger::new(unified(&server).await);
    at_host.create_channel::<Chat>("chat").unwrap();
    server
        .enable_chat_muting::<Chat>("chat", &said("host", "you are muted"))
        .unwrap();

    let alice = join_as(&server, "alice", password, "aa:bb:cc").await;
    let bob = join_as(&server, "bob", password, "dd:ee:ff").await;
    let at_alice = ChannelMessenger::new(unified(&alice).await);
    let at_bob = ChannelMessenger::new(unified(&bob).await);
    let (alice_sub, mut alice_rx) = collector();
    let (bob_sub, mut bob_rx) = collector();
    at_alice.register_subscriber::<Chat, _>(alice_sub, "chat").unwrap();
    at_bob.register_subscriber::<Chat, _>(bob_sub, "chat").unwrap();

    server.moderation().mute_hardware_address("aa:bb:cc", None);
    at_alice
        .broadcaster::<Chat>("chat")
        .unwrap()
        .call(said("alice", "spam"))
        .unwrap();

    assert_eq!(recv(&mut alice_rx).await, said("alice", "spam"));
    assert_eq!(recv(&mut alice_rx).await, said("host", "you are muted"));
    assert_silent(&mut bob_rx).await;

    // bob's machine is not muted.
    at_bob
        .broadcaster::<Chat>("chat")
        .unwrap()
        .call(said("bob", "hi"))
        .unwrap();
    assert_eq!(recv(&mut alice_rx).await, said("bob", "hi"));
}

#[tokio::test]
async fn test_hardware_mute_silences_password_login() {
    assert_muted_by_hardware(Some("s3cret")).await;
}

#[tokio::test]
async fn test_hardware_mute_silences_anonymous_login() {
    assert_muted_by_hardware(None).await;
}
