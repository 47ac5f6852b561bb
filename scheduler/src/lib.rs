// streamsched — static scheduler for hierarchical stream graphs
//
// Library root. Scheduling passes and their supporting models.

pub mod balance;
pub mod diag;
pub mod dot;
pub mod flow;
pub mod id;
pub mod latency;
pub mod pass;
pub mod portal;
pub mod rational;
pub mod schedule;
pub mod scheduler;
pub mod sdep;
pub mod simulate;
pub mod stream;
pub mod topology;
