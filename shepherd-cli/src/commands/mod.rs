//! CLI subcommands

pub mod cluster;
