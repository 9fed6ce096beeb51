/// Failures while deriving a cache key from a query packet.
///
/// Callers treat these as "do not cache / do not look up" for the packet at hand.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cannot compute cache key: packet of {len} bytes is shorter than a DNS header")]
    PacketTooShort { len: usize },

    #[error("cannot compute cache key: packet of {len} bytes ends inside the {consumed}-byte question name")]
    QuestionOverrun { len: usize, consumed: usize },
}
