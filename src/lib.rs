pub mod cli;
pub mod config;
pub mod join;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod storage;
pub mod web;
