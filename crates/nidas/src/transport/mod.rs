// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Framed transport (§4.5): wire codec, the abstract [`IOChannel`] pipe,
//! its three concrete implementations, and the framed stream wrapper that
//! sits on top of any of them.

pub mod fileset;
pub mod frame;
pub mod iochannel;
pub mod mcsocket;
pub mod socket;
pub mod stream;

pub use fileset::{FileSet, RolloverTrigger};
pub use frame::{FrameHeader, FRAME_HEADER_LEN};
pub use iochannel::{ConnectionRequester, IOChannel};
pub use mcsocket::{McSocket, McSocketAccepter, McSocketRequester, McSocketRole, RendezvousDatagram};
pub use socket::{ConnectionState, Socket, SocketConfig};
pub use stream::{BackpressurePolicy, InputStream, OutputStream, StreamHeader};
