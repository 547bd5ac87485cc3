// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod abstract_tracker;
pub mod background_executor;
pub mod camera_core;
pub mod camera_lifecycle;
pub mod capture_request;
pub mod capture_session;
pub mod config;
pub mod errors;
pub mod exit_latch;
pub mod image_reader;
pub mod pipeline_arbiter;
pub mod safety_barrier;
pub mod shared_camera;
pub mod sim_camera;
pub mod sim_tracker;
pub mod surface;
