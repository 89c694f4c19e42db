// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

mod doc_writer;

pub use self::doc_writer::*;

mod doc_writer_per_thread;

pub use self::doc_writer_per_thread::*;

mod flush_control;

pub use self::flush_control::*;

mod flush_policy;

pub use self::flush_policy::*;

mod index_writer_config;

pub use self::index_writer_config::*;

mod stall_control;

pub use self::stall_control::*;
