// Realtime chat transport: connection authorization, per-room broadcast
// groups and the session loop that ties them to a WebSocket.

pub mod authorizer;
pub mod controller;
pub mod handler;
pub mod hub;
pub mod protocol;


pub use handler::{router, ChatSocketState};
