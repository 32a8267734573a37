//! wled-client - WLED JSON API client
//!
//! Wraps reqwest to provide the device operations the discovery engine
//! needs: identity verification, state refresh, and firmware upload.

pub mod client;

pub use client::{
    ClientConfig, ClientError, DeviceApi, ErrorKind, Identity, WledClient, DEFAULT_HTTP_PORT,
    STATE_INFO_PATH, UPDATE_PATH,
};
