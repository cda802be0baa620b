// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cluster RPC fabric: sessions, transports and the cluster that
//! owns them.

pub mod cluster;
pub mod session;
pub mod transport;

pub use cluster::{Cluster, Dispatch, Responder, Subsys};
pub use session::{CallError, CallHandle, Session};
pub use transport::Transport;
