use thiserror::Error;

/// Router error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors: fatal, raised during construction.
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("missing conditions in rule")]
    EmptyRule,

    #[error("missing rules in logical rule")]
    EmptyLogicalRule,

    #[error("duplicate rule-set tag: {0}")]
    DuplicateRuleSetTag(String),

    #[error("duplicate dns server tag: {0}")]
    DuplicateDnsServerTag(String),

    #[error("missing address")]
    MissingAddress,

    #[error("missing address_resolver")]
    MissingAddressResolver,

    #[error("address resolver not found: {0}")]
    AddressResolverNotFound(String),

    #[error("found circular reference in dns servers: {0}")]
    CircularDnsServers(String),

    #[error("default dns server not found: {0}")]
    DefaultDnsServerNotFound(String),

    #[error("default DNS server cannot be fakeip")]
    DefaultDnsServerIsFakeIp,

    #[error("default detour not found: {0}")]
    DefaultDetourNotFound(String),

    #[error("outbound not found for rule[{index}]: {tag}")]
    RuleOutboundNotFound { index: usize, tag: String },

    #[error("rule-set not found: {0}")]
    RuleSetNotFound(String),

    #[error("router is already initialized")]
    AlreadyInitialized,

    #[error("invalid config: {0}")]
    Config(String),

    // Routing errors: per connection, returned to the inbound.
    #[error("reject connection to {0} while device paused")]
    DevicePaused(String),

    #[error("routing loop on detour: {0}")]
    DetourLoop(String),

    #[error("inbound detour not found: {0}")]
    InboundDetourNotFound(String),

    #[error("inbound detour is not injectable: {0}")]
    InboundDetourNotInjectable(String),

    #[error("inject: {0} unsupported")]
    InjectNetworkUnsupported(&'static str),

    #[error("{0}")]
    Deprecated(&'static str),

    #[error("missing fakeip context")]
    MissingFakeIpContext,

    #[error("missing supported outbound, closing {0} connection")]
    NoSupportedOutbound(&'static str),

    #[error("missing default outbound for {0} connections")]
    MissingDefaultOutbound(&'static str),

    #[error("connection loopback in outbound/{kind}[{tag}]")]
    OutboundLoopback { kind: String, tag: String },

    #[error("outbound provider not found: {0}")]
    OutboundProviderNotFound(String),

    // Resolution errors.
    #[error("resolve {domain}: {message}")]
    Resolve { domain: String, message: String },

    #[error("dns: response code {0:?}")]
    Rcode(hickory_proto::op::ResponseCode),

    #[error("dns: query canceled")]
    QueryCanceled,

    #[error("dns message: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    // I/O errors are passed through.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap the error with a context prefix, like `parse rule[3]`.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for errors that mean the peer went away, logged at debug level
    /// instead of error level.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            Error::QueryCanceled => true,
            Error::Context { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain() {
        let err = Error::MissingAddress.context("parse dns server[a]");
        assert_eq!(err.to_string(), "parse dns server[a]: missing address");
    }

    #[test]
    fn test_circular_reference_message() {
        let err = Error::CircularDnsServers("a b".to_string());
        assert_eq!(
            err.to_string(),
            "found circular reference in dns servers: a b"
        );
    }

    #[test]
    fn test_is_closed() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        assert!(err.is_closed());
        assert!(err.context("read query").is_closed());
        assert!(!Error::MissingAddress.is_closed());
    }
}
