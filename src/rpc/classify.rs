//! Retriability classification of upstream RPC error responses.
//!
//! The non-retriable set is dominated by client-side state errors (bad
//! transactions, missing methods) where retrying on another node would
//! either harm correctness or burn capacity for nothing. Everything else is
//! worth another node.

/// Error codes that no other node would answer differently.
const NONRETRIABLE_CODES: &[i64] = &[
    // "execution reverted"
    3,
    // "Reverted", "VM execution error."
    -32015,
    // "OldNonce", "AlreadyKnown"
    -32010,
    // "the method ... does not exist/is not available"
    // Note: `-32601` ("method not found") stays retriable because some
    // methods are only implemented by some of the nodes (e.g.
    // `linea_estimateGas` is not available on `infura`).
    32601,
];

const NONRETRIABLE_MESSAGES: &[&str] = &[
    // code: -32000, seen on `bouncebit`
    ": tx already in mempool",
    // code: -32000, seen on `polygonzkevm`
    "RPC error response: RPC error response: INTERNAL_ERROR: nonce too low",
];

const NONRETRIABLE_MESSAGE_PREFIXES: &[&str] = &[
    // code: -32000, seen on `bsquared`
    "nonce too low: ",
    // code: -32000, seen on `bouncebit`, e.g.
    // "rpc error: code = Unknown desc = execution reverted: 0x5a421bd9..."
    "rpc error: code = Unknown desc = execution reverted",
];

/// Whether an upstream error response with this `(code, message)` may
/// succeed on another node.
#[must_use]
pub fn is_retriable(code: i64, message: &str) -> bool {
    if NONRETRIABLE_CODES.contains(&code) {
        return false;
    }
    if NONRETRIABLE_MESSAGES.contains(&message) {
        return false;
    }
    if NONRETRIABLE_MESSAGE_PREFIXES
        .iter()
        .any(|prefix| message.starts_with(prefix))
    {
        return false;
    }
    true
}
