//! Socket handle tracking for network monitoring
//!
//! Only meaningful on platforms that report handle-based IO. Device io
//! control and wait events are recorded only when they touch a handle that
//! was reported as a socket.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// Payload of a device io control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIoControl {
    pub result: u32,
    pub socket: u64,
    #[serde(default)]
    pub event: Option<u64>,
    pub control_code: u32,
    #[serde(default)]
    pub input_length: u32,
    #[serde(default)]
    pub output_length: u32,
}

/// Network activity worth recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    SocketOpened {
        handle: u64,
    },
    SocketClosed {
        handle: u64,
    },
    DeviceIoControl {
        socket: u64,
        control_code: u32,
        result: u32,
        input_length: u32,
        output_length: u32,
    },
    Wait {
        handles: Vec<u64>,
        wait_all: bool,
        result: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketInfo {
    opened_by: u64,
    io_requests: u64,
}

/// Live socket handles, process-wide
#[derive(Debug, Default)]
pub struct HandleTracker {
    sockets: FnvHashMap<u64, SocketInfo>,
    /// Event handles passed with io requests, mapped to their socket
    events: FnvHashMap<u64, u64>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_socket(&self, handle: u64) -> bool {
        self.sockets.contains_key(&handle)
    }

    pub fn socket_handle(
        &mut self,
        thread: u64,
        handle: u64,
        created: bool,
    ) -> Option<NetworkEvent> {
        if created {
            self.sockets.insert(
                handle,
                SocketInfo {
                    opened_by: thread,
                    io_requests: 0,
                },
            );
            return Some(NetworkEvent::SocketOpened { handle });
        }
        let info = self.sockets.remove(&handle)?;
        self.events.retain(|_, socket| *socket != handle);
        tracing::debug!(
            handle,
            opened_by = info.opened_by,
            requests = info.io_requests,
            "socket closed"
        );
        Some(NetworkEvent::SocketClosed { handle })
    }

    pub fn device_io_control(&mut self, request: &DeviceIoControl) -> Option<NetworkEvent> {
        let info = self.sockets.get_mut(&request.socket)?;
        info.io_requests += 1;
        if let Some(event) = request.event {
            self.events.insert(event, request.socket);
        }
        Some(NetworkEvent::DeviceIoControl {
            socket: request.socket,
            control_code: request.control_code,
            result: request.result,
            input_length: request.input_length,
            output_length: request.output_length,
        })
    }

    fn is_tracked(&self, handle: u64) -> bool {
        self.sockets.contains_key(&handle) || self.events.contains_key(&handle)
    }

    pub fn wait_for_single_object(&self, handle: u64) -> Option<NetworkEvent> {
        self.is_tracked(handle).then(|| NetworkEvent::Wait {
            handles: vec![handle],
            wait_all: true,
            result: None,
        })
    }

    /// Records only the tracked handles in the set
    pub fn wait_for_multiple_objects(
        &self,
        result: u32,
        handles: &[u64],
        wait_all: bool,
    ) -> Option<NetworkEvent> {
        let tracked: Vec<u64> = handles.iter().copied().filter(|&h| self.is_tracked(h)).collect();
        if tracked.is_empty() {
            return None;
        }
        Some(NetworkEvent::Wait {
            handles: tracked,
            wait_all,
            result: Some(result),
        })
    }
}
