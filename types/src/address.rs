//! Bus address naming.
//!
//! Addresses are stable, lowercase, kind-qualified strings. Callers must
//! know the kind in advance; there is no dynamic discovery.

use crate::schema::EntityKind;

/// Address of the delay scheduler's schedule endpoint.
pub const SCHEDULE_ADDRESS: &str = "schedule";

/// Address of the verifier for a given entity kind.
#[must_use]
pub fn verify_address(kind: &EntityKind) -> String {
    format!("verify.{kind}")
}

/// Address of the processor for a given entity kind.
#[must_use]
pub fn process_address(kind: &EntityKind) -> String {
    format!("process.{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_kind_qualified() {
        let kind = EntityKind::new("course").unwrap();
        assert_eq!(verify_address(&kind), "verify.course");
        assert_eq!(process_address(&kind), "process.course");
    }
}
