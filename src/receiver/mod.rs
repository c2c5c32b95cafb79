// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Receiver subsystem — TCP workers + cleanup coordination + shared counter
//! state + the single-leader aggregator.

pub mod aggregator;
pub mod cleanup;
pub mod state;
pub mod worker;
