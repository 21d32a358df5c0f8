//! Metrics declaration and initialization for the collaborator crate.

use lazy_static::lazy_static;

lazy_static! {
    /// Total transport sends attempted, labeled by outcome.
    pub static ref TRANSPORT_SEND_COUNTER: &'static str = {
        metrics::describe_counter!(
            "gridstream_transport_send_total",
            "Total LoadRequest sends attempted, labeled by outcome."
        );
        "gridstream_transport_send_total"
    };
    /// Marshal/unmarshal failures, labeled by direction.
    pub static ref MARSHAL_ERROR_COUNTER: &'static str = {
        metrics::describe_counter!(
            "gridstream_marshal_errors_total",
            "Total marshal/unmarshal failures, labeled by direction."
        );
        "gridstream_marshal_errors_total"
    };
}
