/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client requests, in the forms they take on their way through the ordering pipeline:
//! 1. [`RequestData`]: what the client submitted.
//! 2. [`Request`]: a `RequestData` together with the replica that relayed it, waiting for a digest.
//! 3. [`PreprocessResult`]: a `RequestData` together with its digest, ready to be batched.
//! 4. [`RequestRef`]: the compact form of a preprocessed request used inside preprepares and log
//!    entries.

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{ClientID, Digest, NodeID, ReqNo};

/// A client-submitted command. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct RequestData {
    pub client_id: ClientID,
    pub req_no: ReqNo,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A request that needs to be preprocessed (digested) before it may enter a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// The replica that relayed the request. For locally proposed requests this is the local replica.
    pub source: NodeID,
    pub client_request: RequestData,
}

/// The deterministic digest of a [`RequestData`], as computed by the external collaborator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreprocessResult {
    pub digest: Digest,
    pub request_data: RequestData,
}

impl PreprocessResult {
    /// Get the [`RequestRef`] that identifies this request inside a batch.
    pub fn request_ref(&self) -> RequestRef {
        RequestRef {
            client_id: self.request_data.client_id.clone(),
            req_no: self.request_data.req_no,
            digest: self.digest.clone(),
        }
    }
}

/// Reference to a preprocessed request: enough to identify it and check its content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct RequestRef {
    pub client_id: ClientID,
    pub req_no: ReqNo,
    pub digest: Digest,
}
