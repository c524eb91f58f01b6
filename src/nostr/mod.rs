pub use client::NostrTransport;
pub use identity::Identity;

mod client;
mod identity;
