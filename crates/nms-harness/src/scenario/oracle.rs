//! Oracle functions for scenario verification.
//!
//! An oracle runs once the scenario is over and checks global consistency
//! across both endpoints.

use crate::scenario::World;

/// Oracle function type.
///
/// Returns `Err(message)` for the first invariant that does not hold.
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Both ends hold an established session.
pub fn all_established() -> OracleFn {
    Box::new(|world| {
        if world.all_established() {
            Ok(())
        } else {
            Err(format!(
                "not established: agent {:?}, collector {:?}",
                world.agent().state(),
                world.collector().peer_state(crate::scenario::agent_addr())
            ))
        }
    })
}

/// Both ends derived the same secret.
pub fn secrets_match() -> OracleFn {
    Box::new(|world| {
        if world.secrets_match() {
            Ok(())
        } else {
            Err("shared secrets differ across endpoints".to_string())
        }
    })
}

/// The collector received exactly `count` reports.
pub fn reports_received(count: usize) -> OracleFn {
    Box::new(move |world| {
        let received = world.reports().len();
        if received == count {
            Ok(())
        } else {
            Err(format!("expected {count} reports, collector saw {received}"))
        }
    })
}

/// Neither endpoint returned an error.
pub fn no_errors() -> OracleFn {
    Box::new(|world| match world.errors() {
        [] => Ok(()),
        errors => Err(format!("endpoint errors: {}", errors.join("; "))),
    })
}

/// Run every oracle, stopping at the first failure.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
