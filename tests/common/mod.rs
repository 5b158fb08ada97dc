#![allow(dead_code)]

pub(crate) mod counter_app;

pub(crate) mod fixtures;

pub(crate) mod logging;

pub(crate) mod mem_log;

pub(crate) mod network;

pub(crate) mod node;
