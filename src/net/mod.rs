pub mod callbacks;
pub mod client;

pub use callbacks::CompletionRegistry;
pub use client::{
    HttpLockTransport, HttpPeerClient, LaunchRequest, LaunchResponse, PeerExecClient, PeerHandle,
    RemoteCompletion,
};
