// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

pub mod constants;
pub mod controller;
pub mod egress;
pub mod forwarder;
pub mod nitro_cli;
