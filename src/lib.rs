//! adharvest - browser-driven harvesting of app-store destinations from ad
//! detail pages.
//!
//! Rows of a spreadsheet name ad detail pages; each page is rendered in a
//! stealth browser session, the advertised app's store link, name and
//! tagline are extracted from the page and its ad frames, and the results
//! are written back to the row.

#![allow(clippy::should_implement_trait)]

pub mod block;
pub mod browser;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod extract;
pub mod model;
pub mod orchestrator;
pub mod pacing;
pub mod retry;
pub mod session;
pub mod sink;
pub mod source;
pub mod store;
