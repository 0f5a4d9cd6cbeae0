//! Adverse network conditions on the simulated mesh.

mod clock_skew;
mod message_loss;
mod partition;
