pub mod dispatcher;
pub mod listener;
pub mod server;

pub use dispatcher::{DedicatedDispatcher, PendingConnection};
pub use listener::{retry_addr_in_use, BoundSocket, ListenerSet, RetryPolicy, SocketKind};
pub use server::Transport;
