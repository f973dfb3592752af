//! Operations travel down the pipeline and complete exactly once.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use tracing::warn;

use crate::{
    auth::NonRenewableSasToken,
    error::PipelineError,
    models::{Message, MethodResponse, RegistrationResult},
    panic::run_callback,
    transport::ConnectionArgs,
};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique operation identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OpId(u64);

impl OpId {
    fn next() -> Self { Self(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)) }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "op-{}", self.0) }
}

/// Receive-side capability that can be switched on and off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Cloud-to-device messages.
    C2dMessages,
    /// Module input messages.
    InputMessages,
    /// Direct method requests.
    Methods,
    /// Responses to twin requests.
    TwinResponses,
    /// Desired-property patches.
    TwinPatches,
    /// Responses from the provisioning service.
    ProvisioningResponses,
}

impl Feature {
    /// Stable lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::C2dMessages => "c2d",
            Self::InputMessages => "input",
            Self::Methods => "methods",
            Self::TwinResponses => "twin",
            Self::TwinPatches => "twin_patches",
            Self::ProvisioningResponses => "provisioning",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Which service a request/response exchange targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestType {
    /// Device twin.
    Twin,
    /// Provisioning registration.
    Register,
    /// Provisioning operation status.
    Query { operation_id: String },
}

impl RequestType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Twin => "twin",
            Self::Register => "register",
            Self::Query { .. } => "query",
        }
    }
}

/// A request whose response arrives as a separate event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RequestSpec {
    pub(crate) request_type: RequestType,
    pub(crate) method: &'static str,
    pub(crate) resource_location: &'static str,
    pub(crate) body: Bytes,
}

/// Response correlated to a [`RequestSpec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) body: Bytes,
    pub(crate) retry_after: Option<Duration>,
}

/// What an operation asks the pipeline to do.
#[derive(Debug)]
pub(crate) enum OpKind {
    Initialize,
    SetConnectionArgs(ConnectionArgs),
    Connect,
    Disconnect,
    Reauthorize,
    UpdateSasToken(NonRenewableSasToken),
    EnableFeature(Feature),
    DisableFeature(Feature),
    RequestAndResponse(RequestSpec),
    Request { request_id: String, spec: RequestSpec },
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    SendTelemetry(Message),
    SendOutputMessage(Message),
    SendMethodResponse(MethodResponse),
    GetTwin,
    PatchTwinReportedProperties(Value),
    Register { payload: Option<Value> },
    PollStatus { operation_id: String },
}

impl OpKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::SetConnectionArgs(_) => "set_connection_args",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reauthorize => "reauthorize",
            Self::UpdateSasToken(_) => "update_sas_token",
            Self::EnableFeature(_) => "enable_feature",
            Self::DisableFeature(_) => "disable_feature",
            Self::RequestAndResponse(_) => "request_and_response",
            Self::Request { .. } => "request",
            Self::Publish { .. } => "publish",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::SendTelemetry(_) => "send_telemetry",
            Self::SendOutputMessage(_) => "send_output_message",
            Self::SendMethodResponse(_) => "send_method_response",
            Self::GetTwin => "get_twin",
            Self::PatchTwinReportedProperties(_) => "patch_twin_reported_properties",
            Self::Register { .. } => "register",
            Self::PollStatus { .. } => "poll_status",
        }
    }

    /// Operations that touch the broker and so need a live connection.
    pub(crate) fn needs_connection(&self) -> bool {
        matches!(
            self,
            Self::Publish { .. } | Self::Subscribe { .. } | Self::Unsubscribe { .. }
        )
    }

    /// Operations that change the physical connection.
    pub(crate) fn is_connection_op(&self) -> bool {
        matches!(self, Self::Connect | Self::Disconnect | Self::Reauthorize)
    }
}

/// Value an operation produces on success.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum OpOutput {
    Done,
    Twin(Value),
    Response(Response),
    Registration(RegistrationResult),
}

/// Outcome delivered to whoever submitted an operation.
pub(crate) type OpResult = Result<OpOutput, PipelineError>;

type Callback = Box<dyn FnOnce(OpResult) + Send>;

/// Where an operation's result goes.
pub(crate) enum Completion {
    /// A caller awaiting the result.
    Caller(oneshot::Sender<OpResult>),
    /// An application callback, run on the pipeline context.
    Callback(Callback),
    /// A pipeline-internal operation nobody waits on.
    Internal,
}

/// Fires a [`Completion`] at most once.
pub(crate) struct Completer {
    done: AtomicBool,
    completion: Option<Completion>,
    kind: &'static str,
}

impl Completer {
    fn new(completion: Completion, kind: &'static str) -> Self {
        Self {
            done: AtomicBool::new(false),
            completion: Some(completion),
            kind,
        }
    }

    pub(crate) fn is_done(&self) -> bool { self.done.load(Ordering::Acquire) }

    /// Deliver `result`. Returns `Ok(false)` when the operation had already
    /// completed, in which case `result` is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CallbackPanicked`] when an application
    /// callback panics.
    pub(crate) fn complete(&mut self, result: OpResult) -> Result<bool, PipelineError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.completion.take() {
            Some(Completion::Caller(tx)) => {
                // The caller may have stopped waiting.
                let _ = tx.send(result);
            }
            Some(Completion::Callback(callback)) => run_callback(move || callback(result))?,
            Some(Completion::Internal) | None => {}
        }
        Ok(true)
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        let awaited = matches!(
            self.completion,
            Some(Completion::Caller(_) | Completion::Callback(_))
        );
        if awaited && !self.is_done() {
            warn!(op = self.kind, "operation dropped without completing");
        }
    }
}

/// A unit of work flowing down the pipeline.
///
/// A stage that wants to see an operation's result registers itself as an
/// interceptor before passing it on; completion then unwinds through the
/// interceptors in reverse order. A worker operation carries the operation
/// that spawned it as its parent and completes that parent when it finishes.
pub(crate) struct Operation {
    pub(crate) id: OpId,
    pub(crate) kind: OpKind,
    pub(crate) origin: Option<OpId>,
    pub(crate) first_attempt: Option<Instant>,
    pub(crate) attempts: u32,
    interceptors: Vec<usize>,
    parent: Option<Box<Operation>>,
    completer: Completer,
}

impl Operation {
    pub(crate) fn new(kind: OpKind, completion: Completion) -> Self {
        let completer = Completer::new(completion, kind.name());
        Self {
            id: OpId::next(),
            kind,
            origin: None,
            first_attempt: None,
            attempts: 0,
            interceptors: Vec::new(),
            parent: None,
            completer,
        }
    }

    /// An operation whose result is delivered through a oneshot channel.
    pub(crate) fn with_caller(kind: OpKind) -> (Self, oneshot::Receiver<OpResult>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(kind, Completion::Caller(tx)), rx)
    }

    /// An operation whose result is passed to `callback`.
    pub(crate) fn with_callback(kind: OpKind, callback: impl FnOnce(OpResult) + Send + 'static) -> Self {
        Self::new(kind, Completion::Callback(Box::new(callback)))
    }

    pub(crate) fn internal(kind: OpKind) -> Self { Self::new(kind, Completion::Internal) }

    /// A worker that completes `parent` with its own result.
    pub(crate) fn worker(kind: OpKind, parent: Operation) -> Self {
        let mut op = Self::internal(kind);
        op.parent = Some(Box::new(parent));
        op
    }

    /// A worker standing in for the operation identified by `origin`, which
    /// the spawning stage keeps for itself.
    pub(crate) fn delegate(kind: OpKind, origin: OpId) -> Self {
        let mut op = Self::internal(kind);
        op.origin = Some(origin);
        op
    }

    pub(crate) fn name(&self) -> &'static str { self.kind.name() }

    pub(crate) fn needs_connection(&self) -> bool { self.kind.needs_connection() }

    pub(crate) fn is_completed(&self) -> bool { self.completer.is_done() }

    pub(crate) fn push_interceptor(&mut self, stage: usize) { self.interceptors.push(stage); }

    pub(crate) fn pop_interceptor(&mut self) -> Option<usize> { self.interceptors.pop() }

    pub(crate) fn take_parent(&mut self) -> Option<Operation> { self.parent.take().map(|parent| *parent) }

    /// Time since the first attempt, starting the clock when unset.
    pub(crate) fn elapsed_since_first_attempt(&mut self) -> Duration {
        self.first_attempt.get_or_insert_with(Instant::now).elapsed()
    }

    pub(crate) fn fire(&mut self, result: OpResult) -> Result<bool, PipelineError> {
        self.completer.complete(result)
    }

    /// Fail this operation and every parent above it with
    /// [`PipelineError::OperationCancelled`], bypassing interceptors.
    pub(crate) fn cancel(mut self, reason: &str) {
        if let Some(parent) = self.take_parent() {
            parent.cancel(reason);
        }
        if let Err(err) = self.fire(Err(PipelineError::OperationCancelled(reason.to_owned()))) {
            warn!(op = self.name(), error = %err, "cancellation callback panicked");
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("attempts", &self.attempts)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}
