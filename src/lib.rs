//! Phase scheduling for component hierarchies.
//!
//! A run walks a graph of phase nodes (build, connect, run, reset, main,
//! report, ...) over a tree of components. Function phases call every
//! component once in a fixed order; task phases spawn one activity per
//! component and stay open while any of them holds an objection.

pub mod component;
pub mod config;
pub mod dag;
pub mod demo;
pub mod errors;
pub mod objection;
pub mod phase;
pub mod traverse;
