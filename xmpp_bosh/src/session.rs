//! The BOSH transport session.
//!
//! [`SessionCore`] holds the protocol state and is driven synchronously;
//! [`SessionDriver`] runs it against an [`HttpClient`](crate::http_client::HttpClient)
//! on a tokio task, fed by a cloneable [`SessionHandle`].

mod driver;
mod ids;
mod reassembly;
mod state;

pub use self::{
    driver::{InboundSink, SessionDriver, SessionHandle, session},
    ids::{MAX_RID, Rid, RidSequence, Sid},
    reassembly::ReassemblyBuffer,
    state::{
        Closing, Delivery, OutboundRequest, SessionCore, SessionState, Termination,
        TransmitState,
    },
};
