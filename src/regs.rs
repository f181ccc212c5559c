// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Register layouts used by the transmitter side and the DPCD addresses of the sink.
//!
//! Offsets of the transmitter registers differ between silicon generations and are not listed
//! here, see [`Generation`](crate::generation::Generation). Only the bit layout within the
//! registers is fixed.

use crate::util;

/// Transmitter port control register.
pub mod port {
    use super::util;

    pub type Enable = util::RegBit<31>;
    pub type PipeBSelect = util::RegBit<30>;
    pub type LinkTrain = util::RegField<29, 28>;
    pub const LINK_TRAIN_PATTERN_1: u32 = 0b00;
    pub const LINK_TRAIN_PATTERN_2: u32 = 0b01;
    pub const LINK_TRAIN_IDLE: u32 = 0b10;
    pub const LINK_TRAIN_OFF: u32 = 0b11;
    pub type PortWidth = util::RegField<20, 19>;
    pub const PORT_WIDTH_X1: u32 = 0b00;
    pub const PORT_WIDTH_X2: u32 = 0b01;
    pub const PORT_WIDTH_X4: u32 = 0b11;
    pub type EnhancedFraming = util::RegBit<18>;
    pub type ScramblingDisable = util::RegBit<7>;
}

/// AUX channel control register. The five data registers follow it at 4 byte stride.
pub mod aux_ctl {
    use super::util;

    pub type SendBusy = util::RegBit<31>;
    pub type Done = util::RegBit<30>;
    pub type InterruptOnDone = util::RegBit<29>;
    pub type TimeOutError = util::RegBit<28>;
    pub type ReceiveError = util::RegBit<25>;
    pub type MessageSize = util::RegField<24, 20>;

    /// Status bits that stay set until written back as one.
    pub const STICKY_MASK: u32 = Done::MASK | TimeOutError::MASK | ReceiveError::MASK;

    pub const DATA_REGISTERS: u32 = 5;
    /// Request header takes the first four bytes of the data registers.
    pub const HEADER_BYTES: usize = 4;
}

/// AUX request header and reply layout in the first data register.
pub mod aux_msg {
    use super::util;

    pub type Command = util::RegField<31, 28>;
    pub type Address = util::RegField<27, 8>;
    pub type LengthMinusOne = util::RegField<7, 0>;

    pub type NativeReply = util::RegField<29, 28>;
    pub type I2cReply = util::RegField<31, 30>;

    pub const REPLY_ACK: u32 = 0b00;
    pub const REPLY_NACK: u32 = 0b01;
    pub const REPLY_DEFER: u32 = 0b10;
}

/// PHY sideband packet register.
pub mod sideband {
    use super::util;

    pub type Busy = util::RegBit<0>;
    pub type ByteEnable = util::RegField<7, 4>;
    pub type Port = util::RegField<15, 8>;
    pub type Opcode = util::RegField<23, 16>;
    pub type Rid = util::RegField<31, 24>;

    pub const OPCODE_READ: u32 = 0;
    pub const OPCODE_WRITE: u32 = 1;
    pub const BYTE_ENABLE_ALL: u32 = 0xf;
}

/// DisplayPort Configuration Data addresses and fields.
pub mod dpcd {
    pub const REV: u32 = 0x000;
    pub const MAX_LINK_RATE: u32 = 0x001;
    pub const MAX_LANE_COUNT: u32 = 0x002;
    pub const MAX_DOWNSPREAD: u32 = 0x003;
    pub const RECEIVE_PORT_0_CAP_0: u32 = 0x008;
    pub const EDP_CONFIGURATION_CAP: u32 = 0x00d;
    pub const TRAINING_AUX_RD_INTERVAL: u32 = 0x00e;

    pub const LINK_BW_SET: u32 = 0x100;
    pub const LANE_COUNT_SET: u32 = 0x101;
    pub const TRAINING_PATTERN_SET: u32 = 0x102;
    pub const TRAINING_LANE0_SET: u32 = 0x103;
    pub const TRAINING_LANE1_SET: u32 = 0x104;
    pub const TRAINING_LANE2_SET: u32 = 0x105;
    pub const TRAINING_LANE3_SET: u32 = 0x106;

    pub const LANE0_1_STATUS: u32 = 0x202;
    pub const LANE2_3_STATUS: u32 = 0x203;
    pub const LANE_ALIGN_STATUS_UPDATED: u32 = 0x204;
    pub const ADJUST_REQUEST_LANE0_1: u32 = 0x206;
    pub const ADJUST_REQUEST_LANE2_3: u32 = 0x207;

    pub const LANE_COUNT_MASK: u32 = 0x1f;
    pub const ENHANCED_FRAME_CAP: u32 = 1 << 7;
    pub const ENHANCED_FRAME_EN: u32 = 1 << 7;
    pub const MAX_DOWNSPREAD_0_5: u32 = 1 << 0;
    pub const LOCAL_EDID_PRESENT: u32 = 1 << 1;
    pub const EDP_CAPABLE_MASK: u32 = 0xb;

    pub const TRAINING_PATTERN_DISABLE: u32 = 0;
    pub const TRAINING_PATTERN_1: u32 = 1;
    pub const TRAINING_PATTERN_2: u32 = 2;
    pub const SCRAMBLING_DISABLE: u32 = 1 << 5;

    pub const LANE_CR_DONE: u8 = 1 << 0;
    pub const LANE_CHANNEL_EQ_DONE: u8 = 1 << 1;
    pub const LANE_SYMBOL_LOCKED: u8 = 1 << 2;
    pub const INTERLANE_ALIGN_DONE: u8 = 1 << 0;

    /// `TRAINING_LANEx_SET` byte.
    pub mod lane_set {
        pub const SWING_SHIFT: u8 = 0;
        pub const MAX_SWING_REACHED: u8 = 1 << 2;
        pub const PREEMPHASIS_SHIFT: u8 = 3;
        pub const MAX_PREEMPHASIS_REACHED: u8 = 1 << 5;
    }
}
