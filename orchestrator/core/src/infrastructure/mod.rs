// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod codec;
pub mod event_bus;
pub mod protocol_parser;
pub mod repositories;

pub use event_bus::EventBus;
pub use protocol_parser::{ProtocolParseError, ProtocolParser};
