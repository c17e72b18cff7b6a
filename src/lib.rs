// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod bdev;
pub mod cfg;
pub mod ctrlr;
pub mod nvme;
pub mod pdu;
pub mod subsystem;
pub mod transport;
