/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the components of the ordering core.
//!
//! Types specific to one component (for example, the vote collectors of the
//! [epoch](crate::epoch)) live in that component's module.

pub mod data_types;

pub mod network_config;

pub mod requests;
