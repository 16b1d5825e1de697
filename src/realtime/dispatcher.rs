//! Message decode and listener fan-out
//!
//! Each listener call is isolated: an `Err` return or a panic is captured as
//! a [`DispatchError::Listener`] and the remaining listeners still run.

use super::registry::{Listener, ListenerId};
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to decode message for {destination}: {source}")]
    Decode {
        destination: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Message for {destination} is not a JSON object or array")]
    NotStructured { destination: String },

    #[error("{listener} on {destination} failed: {reason}")]
    Listener {
        destination: String,
        listener: ListenerId,
        reason: String,
    },
}

/// Outcome of delivering one message
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Listeners that returned normally
    pub delivered: usize,
    /// One entry per listener that failed
    pub failures: Vec<DispatchError>,
}

/// Decode a message body into structured JSON (object or array)
pub fn decode_payload(destination: &str, body: &[u8]) -> Result<Value, DispatchError> {
    let value: Value = serde_json::from_slice(body).map_err(|source| DispatchError::Decode {
        destination: destination.to_string(),
        source,
    })?;

    if !(value.is_object() || value.is_array()) {
        return Err(DispatchError::NotStructured {
            destination: destination.to_string(),
        });
    }

    Ok(value)
}

/// Invoke every listener with the payload, in order
pub fn fan_out(
    destination: &str,
    payload: &Value,
    listeners: &[(ListenerId, Listener)],
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for (id, listener) in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener(payload)));
        let reason = match outcome {
            Ok(Ok(())) => {
                report.delivered += 1;
                continue;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        report.failures.push(DispatchError::Listener {
            destination: destination.to_string(),
            listener: *id,
            reason,
        });
    }

    report
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
