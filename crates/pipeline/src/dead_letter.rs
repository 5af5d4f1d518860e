//! Handler-initiated dead-lettering.

use postbus_core::TransactionContext;

const MANUAL_DEAD_LETTER_KEY: &str = "postbus.manual-dead-letter";

/// Request recorded by a handler that wants its message forwarded to the error
/// queue without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualDeadLetter {
    pub reason: String,
}

/// Ask for the current message to be dead-lettered once handling completes.
///
/// The last request wins.
pub fn request_dead_letter(transaction: &dyn TransactionContext, reason: impl Into<String>) {
    transaction.items().insert(
        MANUAL_DEAD_LETTER_KEY,
        ManualDeadLetter {
            reason: reason.into(),
        },
    );
}

/// Remove and return a pending request.
pub fn take_dead_letter_request(transaction: &dyn TransactionContext) -> Option<ManualDeadLetter> {
    let request = transaction
        .items()
        .get::<ManualDeadLetter>(MANUAL_DEAD_LETTER_KEY)?;
    transaction.items().remove(MANUAL_DEAD_LETTER_KEY);
    Some((*request).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postbus_core::InMemoryTransactionContext;

    #[test]
    fn request_is_taken_once() {
        let tx = InMemoryTransactionContext::new();
        assert_eq!(take_dead_letter_request(&tx), None);

        request_dead_letter(&tx, "customer blocked");
        let request = take_dead_letter_request(&tx).unwrap();
        assert_eq!(request.reason, "customer blocked");
        assert_eq!(take_dead_letter_request(&tx), None);
    }
}
