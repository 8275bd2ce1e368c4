//! Engine register blocks of the NV2A.

pub mod bus;
pub mod pcrtc;
pub mod pfifo;
pub mod pgraph;
pub mod pmc;
pub mod ptimer;
pub mod user;
