/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-client tracking of request numbers.
//!
//! A [`ClientWindow`] guarantees two things about the requests of one client:
//! 1. Every `(client_id, req_no)` is admitted into the pipeline at most once.
//! 2. Requests are assigned to sequence numbers, and therefore committed, in strictly increasing
//!    `req_no` order, with no gaps.
//!
//! ## Request lifecycle
//!
//! ```text
//!            admit              on_preprocessed          assign             observe_commit
//! (unknown) -------> Preprocessing ---------------> Ready --------> Assigned ---------------> Committed
//!                                                     ^                |
//!                                                     +----------------+
//!                                                      reset_unassigned
//! ```
//!
//! The window spans `[low_watermark, low_watermark + width)`. `low_watermark` is the lowest request
//! number that is not yet committed. Requests below it are stale.
//!
//! Requests in the next `width` request numbers past the upper edge are held, and admitted once
//! commits slide the window over them. A replica that lags behind the leader of a client's bucket
//! receives the leader's `Forward`s before the commits that make room for them. Requests further
//! ahead are refused.

use std::{
    collections::{btree_map, hash_map, BTreeMap, HashMap},
    mem,
};

use crate::{
    state_machine::StateMachineError,
    types::{
        data_types::{ClientID, NodeID, ReqNo, SeqNo},
        requests::{PreprocessResult, Request, RequestData, RequestRef},
    },
};

/// Outcome of [`ClientWindow::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The request is new, and must now be preprocessed.
    Accepted,
    /// The request is already in the pipeline.
    Duplicate,
    /// The request was already committed.
    Stale,
    /// The request is past the window, and was held until the window slides over it.
    Held,
    /// The request number is too far ahead of the client's lowest uncommitted request.
    OutOfWindow,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        self == Admission::Accepted
    }
}

#[derive(Clone, Debug)]
enum RequestState {
    Preprocessing { request_data: RequestData },
    Ready(PreprocessResult),
    Assigned { seq_no: SeqNo, request: PreprocessResult },
    Committed,
}

/// The request numbers of one client, and the state of each of them.
#[derive(Clone, Debug)]
pub struct ClientWindow {
    width: u64,
    low_watermark: ReqNo,
    next_unassigned: ReqNo,
    requests: BTreeMap<ReqNo, RequestState>,
    held: BTreeMap<ReqNo, Request>,
}

impl ClientWindow {
    pub fn new(width: u64) -> ClientWindow {
        ClientWindow {
            width,
            low_watermark: ReqNo::first(),
            next_unassigned: ReqNo::first(),
            requests: BTreeMap::new(),
            held: BTreeMap::new(),
        }
    }

    /// The lowest request number of this client that has not been committed.
    pub fn low_watermark(&self) -> ReqNo {
        self.low_watermark
    }

    /// The lowest request number of this client that has not been assigned to a sequence number.
    pub fn next_unassigned(&self) -> ReqNo {
        self.next_unassigned
    }

    /// Admit a request relayed by `source` into the pipeline.
    pub fn admit(&mut self, source: NodeID, request_data: &RequestData) -> Admission {
        let req_no = request_data.req_no;
        if req_no < self.low_watermark {
            return Admission::Stale;
        }
        let window_end = self.low_watermark.int().saturating_add(self.width);
        if req_no.int() >= window_end.saturating_add(self.width) {
            return Admission::OutOfWindow;
        }
        if req_no.int() >= window_end {
            return match self.held.entry(req_no) {
                btree_map::Entry::Occupied(_) => Admission::Duplicate,
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(Request {
                        source,
                        client_request: request_data.clone(),
                    });
                    Admission::Held
                }
            };
        }

        match self.requests.entry(req_no) {
            btree_map::Entry::Occupied(_) => Admission::Duplicate,
            btree_map::Entry::Vacant(entry) => {
                entry.insert(RequestState::Preprocessing {
                    request_data: request_data.clone(),
                });
                Admission::Accepted
            }
        }
    }

    /// Record the digest of a request previously [admitted](Self::admit).
    ///
    /// Returns whether the request became ready. Results for requests that are already ready (or
    /// further along) are replays, and are ignored.
    ///
    /// # Errors
    /// [`StateMachineError::UnknownRequest`] if the request was never admitted, or was admitted with
    /// different data.
    pub fn on_preprocessed(&mut self, result: PreprocessResult) -> Result<bool, StateMachineError> {
        let req_no = result.request_data.req_no;
        if req_no < self.low_watermark {
            return Ok(false);
        }

        match self.requests.get_mut(&req_no) {
            Some(state) => match state {
                RequestState::Preprocessing { request_data, .. } => {
                    if *request_data != result.request_data {
                        return Err(StateMachineError::UnknownRequest {
                            client_id: result.request_data.client_id,
                            req_no,
                        });
                    }
                    *state = RequestState::Ready(result);
                    Ok(true)
                }
                RequestState::Ready(_)
                | RequestState::Assigned { .. }
                | RequestState::Committed => Ok(false),
            },
            None => Err(StateMachineError::UnknownRequest {
                client_id: result.request_data.client_id,
                req_no,
            }),
        }
    }

    /// Take every ready request that directly follows the already assigned ones, advancing
    /// [`next_unassigned`](Self::next_unassigned) past them. The caller must [`assign`](Self::assign)
    /// each of them once it knows their sequence number.
    pub fn drain_ready(&mut self) -> Vec<PreprocessResult> {
        let mut drained = Vec::new();
        while let Some(RequestState::Ready(request)) = self.requests.get(&self.next_unassigned) {
            drained.push(request.clone());
            self.next_unassigned += 1;
        }
        drained
    }

    /// Record that `req_no` was placed in the batch for `seq_no`.
    pub fn assign(&mut self, req_no: ReqNo, seq_no: SeqNo) {
        if let Some(state) = self.requests.get_mut(&req_no) {
            if let RequestState::Ready(request) = state {
                *state = RequestState::Assigned {
                    seq_no,
                    request: request.clone(),
                };
            }
        }
        if req_no >= self.next_unassigned {
            self.next_unassigned = req_no + 1;
        }
    }

    /// Record that `req_no` was committed, advancing the low watermark over every contiguous
    /// committed request, and forgetting them.
    ///
    /// Returns the held requests that the window slid over. They are now admitted, and must be
    /// preprocessed.
    pub fn observe_commit(&mut self, req_no: ReqNo) -> Vec<Request> {
        if req_no < self.low_watermark {
            return Vec::new();
        }
        self.held.remove(&req_no);
        self.requests.insert(req_no, RequestState::Committed);
        while matches!(
            self.requests.get(&self.low_watermark),
            Some(RequestState::Committed)
        ) {
            self.requests.remove(&self.low_watermark);
            self.low_watermark += 1;
        }
        if self.next_unassigned < self.low_watermark {
            self.next_unassigned = self.low_watermark;
        }

        let window_end = ReqNo::new(self.low_watermark.int().saturating_add(self.width));
        let beyond = self.held.split_off(&window_end);
        let entered = mem::replace(&mut self.held, beyond);
        let mut admitted = Vec::new();
        for request in entered.into_values() {
            if self
                .admit(request.source, &request.client_request)
                .is_accepted()
            {
                admitted.push(request);
            }
        }
        admitted
    }

    /// Number of requests held past the window.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Return every assigned but uncommitted request to the ready state. Called when an epoch ends,
    /// since the sequence numbers they were assigned to will not be committed.
    pub fn reset_unassigned(&mut self) {
        for state in self.requests.values_mut() {
            if let RequestState::Assigned { request, .. } = state {
                *state = RequestState::Ready(request.clone());
            }
        }
        self.next_unassigned = self.low_watermark;
    }

    /// The preprocessed form of `req_no`, if it is ready or assigned.
    pub fn preprocessed(&self, req_no: ReqNo) -> Option<&PreprocessResult> {
        match self.requests.get(&req_no) {
            Some(RequestState::Ready(request)) | Some(RequestState::Assigned { request, .. }) => {
                Some(request)
            }
            _ => None,
        }
    }

    /// Check `request` as the `position`-th request of this client inside a preprepare for `seq_no`.
    fn resolve(&self, request: &RequestRef, position: u64, seq_no: SeqNo) -> RefResolution {
        let req_no = request.req_no;
        if req_no < self.low_watermark {
            return RefResolution::Invalid(InvalidBatch::AlreadyCommitted {
                client_id: request.client_id.clone(),
                req_no,
            });
        }

        match self.requests.get(&req_no) {
            Some(RequestState::Committed) => RefResolution::Invalid(InvalidBatch::AlreadyCommitted {
                client_id: request.client_id.clone(),
                req_no,
            }),
            Some(RequestState::Assigned {
                seq_no: assigned,
                request: preprocessed,
            }) => {
                if *assigned != seq_no {
                    RefResolution::Invalid(InvalidBatch::AlreadyAssigned {
                        client_id: request.client_id.clone(),
                        req_no,
                        seq_no: *assigned,
                    })
                } else if preprocessed.digest != request.digest {
                    RefResolution::Invalid(InvalidBatch::DigestMismatch {
                        client_id: request.client_id.clone(),
                        req_no,
                    })
                } else {
                    RefResolution::Ready(preprocessed.clone())
                }
            }
            Some(RequestState::Ready(preprocessed)) => {
                if preprocessed.digest != request.digest {
                    return RefResolution::Invalid(InvalidBatch::DigestMismatch {
                        client_id: request.client_id.clone(),
                        req_no,
                    });
                }
                let expected = self.next_unassigned + position;
                if req_no < expected {
                    RefResolution::Invalid(InvalidBatch::OutOfOrder {
                        client_id: request.client_id.clone(),
                        req_no,
                    })
                } else if req_no > expected {
                    RefResolution::Waiting
                } else {
                    RefResolution::Ready(preprocessed.clone())
                }
            }
            Some(RequestState::Preprocessing { .. }) | None => RefResolution::Waiting,
        }
    }
}

enum RefResolution {
    Ready(PreprocessResult),
    Waiting,
    Invalid(InvalidBatch),
}

/// Outcome of checking the requests referenced by a preprepare against the local client windows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchResolution {
    /// Every referenced request is known, matches, and is next in line for its client.
    Ready(Vec<PreprocessResult>),
    /// Some referenced request is not (yet) preprocessed locally, or earlier requests of its client
    /// have not been assigned.
    Waiting,
    /// The batch can never become valid.
    Invalid(InvalidBatch),
}

/// Reasons why a preprepare's batch is invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidBatch {
    AlreadyCommitted { client_id: ClientID, req_no: ReqNo },
    AlreadyAssigned { client_id: ClientID, req_no: ReqNo, seq_no: SeqNo },
    DigestMismatch { client_id: ClientID, req_no: ReqNo },
    /// A request number repeats, or goes backwards, within the client's requests.
    OutOfOrder { client_id: ClientID, req_no: ReqNo },
    /// A request belongs to a different bucket than the slot.
    WrongBucket { client_id: ClientID, req_no: ReqNo },
}

/// The [`ClientWindow`]s of every client seen so far. Windows are created lazily.
pub struct ClientWindows {
    width: u64,
    windows: HashMap<ClientID, ClientWindow>,
}

impl ClientWindows {
    pub fn new(width: u64) -> ClientWindows {
        ClientWindows {
            width,
            windows: HashMap::new(),
        }
    }

    pub fn get(&self, client_id: &ClientID) -> Option<&ClientWindow> {
        self.windows.get(client_id)
    }

    /// Get the window of `client_id`, creating it if it does not exist.
    pub fn window_mut(&mut self, client_id: &ClientID) -> &mut ClientWindow {
        match self.windows.entry(client_id.clone()) {
            hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hash_map::Entry::Vacant(entry) => entry.insert(ClientWindow::new(self.width)),
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientID, &mut ClientWindow)> {
        self.windows.iter_mut()
    }

    /// Check every request referenced by a preprepare for `seq_no`, in batch order.
    ///
    /// A single invalid reference makes the whole batch invalid. Otherwise, a single unresolvable
    /// reference makes the batch wait.
    pub fn resolve_batch(&self, batch: &[RequestRef], seq_no: SeqNo) -> BatchResolution {
        let mut positions: HashMap<&ClientID, u64> = HashMap::new();
        let mut requests = Vec::with_capacity(batch.len());
        let mut waiting = false;

        for request in batch {
            let position = positions.entry(&request.client_id).or_insert(0);
            let resolution = match self.windows.get(&request.client_id) {
                Some(window) => window.resolve(request, *position, seq_no),
                None => RefResolution::Waiting,
            };
            *position += 1;

            match resolution {
                RefResolution::Ready(preprocessed) => requests.push(preprocessed),
                RefResolution::Waiting => waiting = true,
                RefResolution::Invalid(reason) => return BatchResolution::Invalid(reason),
            }
        }

        if waiting {
            BatchResolution::Waiting
        } else {
            BatchResolution::Ready(requests)
        }
    }

    /// Assign every request of a batch to `seq_no`.
    pub fn assign_batch(&mut self, batch: &[RequestRef], seq_no: SeqNo) {
        for request in batch {
            self.window_mut(&request.client_id)
                .assign(request.req_no, seq_no);
        }
    }

    /// Record the commit of every request of a batch. Returns the held requests that became
    /// admitted.
    pub fn observe_commits(&mut self, batch: &[RequestRef]) -> Vec<Request> {
        let mut admitted = Vec::new();
        for request in batch {
            admitted.extend(
                self.window_mut(&request.client_id)
                    .observe_commit(request.req_no),
            );
        }
        admitted
    }

    pub fn reset_unassigned(&mut self) {
        self.windows
            .values_mut()
            .for_each(|window| window.reset_unassigned());
    }
}
