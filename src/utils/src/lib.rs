// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// Small building blocks shared by every crate of the workspace: half-open
// ranges and the errno-carrying error type.
mod range;
mod sys_error;

pub use range::*;
pub use sys_error::*;
