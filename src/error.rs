/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use std::{io, net::AddrParseError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
    #[error("Invalid IP address: {0}")]
    InvalidIp(#[from] AddrParseError),
    #[error("Unsupported audio encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("NIC matching '{0}' not found")]
    NoSuchNic(String),
    #[error("NIC '{0}' does not resolve to exactly one usable IPv4 address")]
    AmbiguousNic(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ClockError {
    #[error("Clock error: {0}")]
    ClockError(Box<dyn std::error::Error + 'static + Sync + Send>),
    #[error("I/O Error: {0}")]
    IoError(#[from] io::Error),
}

impl ClockError {
    pub fn other<E>(e: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static,
    {
        ClockError::ClockError(Box::new(e))
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum PtpError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("Cannot bind PTP event/general ports (319/320 usually require elevated privileges): {0}")]
    Permission(io::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("PTP port is faulty: {0}")]
    Faulty(String),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ReceiverError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Watch error.")]
    WatchError(#[from] watch::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum SessionError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("PTP error: {0}")]
    PtpError(#[from] PtpError),
    #[error("Receiver error: {0}")]
    ReceiverError(#[from] ReceiverError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum NmosError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("No sender matching '{0}' found in registry")]
    NoSuchSender(String),
    #[error("Sender '{0}' has no manifest")]
    NoManifest(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ClockResult<T> = Result<T, ClockError>;
pub type PtpResult<T> = Result<T, PtpError>;
pub type ReceiverResult<T> = Result<T, ReceiverError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type NmosResult<T> = Result<T, NmosError>;
