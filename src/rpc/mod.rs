//! The request-processing engine: request model, middleware pipeline,
//! node selection/rotation, upstream calls, and health checks.

pub mod check;
pub mod classify;
pub mod client;
pub mod gas;
pub mod middleware;
pub mod models;
