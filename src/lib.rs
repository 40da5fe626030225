//! Distributed print spooling with Ricart-Agrawala mutual exclusion.
//!
//! Every peer is equal. The peers agree on who may talk to the (dumb) print
//! server at each moment by exchanging logically-timestamped request, reply
//! and release messages; the printer itself enforces nothing.

pub mod clock;
pub mod console;
pub mod event;
pub mod mutex;
pub mod net;
pub mod printer;
pub mod workload;
