/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Annotation record types for the local IP annotation service, and the
//! unix-socket HTTP client used by co-resident producers to fetch
//! annotations for the flows they measure.

mod types;
pub use types::{
    Annotations, ClientAnnotations, Geolocation, Network, ServerAnnotations, System,
};

mod client;
pub use client::{AnnotateClient, ClientStats};

/// The request path served by the annotation service.
pub const ANNOTATE_PATH: &str = "/v1/annotate/ips";
