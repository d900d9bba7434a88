/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Rate limiting.
//!
//! Two limiters with different scopes: [`TokenBucket`] is in-process and
//! smooths a single worker's call rate; [`SlidingWindowLimiter`] counts in
//! the database and holds a hard ceiling across every process sharing it.

pub mod sliding_window;
pub mod token_bucket;

pub use sliding_window::{SlidingWindowLimiter, WindowUsage};
pub use token_bucket::TokenBucket;
