use std::io;

/// Errors a resolver can produce. Composite resolvers switch on these to
/// decide whether to try an alternative child or classify a candidate;
/// they are never forwarded to DNS clients as-is (the front end turns any
/// failure into an NXDOMAIN reply).
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No child produced an acceptable reply.
    #[error("no result selected")]
    NoResult,

    /// The reply looks like a censor-injected answer.
    #[error("result may be polluted")]
    MaybePolluted,

    /// The caller-supplied deadline expired while waiting.
    #[error("deadline exceeded")]
    Deadline,

    #[error("bind upstream socket: {0}")]
    Bind(#[source] io::Error),

    #[error("send to upstream: {0}")]
    Send(#[source] io::Error),

    #[error("receive from upstream: {0}")]
    Receive(#[source] io::Error),

    #[error("pack message: {0}")]
    Pack(String),

    #[error("unpack message: {0}")]
    Unpack(String),
}
