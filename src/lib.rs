// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod bridge;
pub mod clear;
pub mod config;
pub mod error;
pub mod frames;
pub mod receiver;
pub mod sender;
pub mod tailer;
pub mod wire;
