/*!
 * Access and Option Flags
 * Bitmasks exchanged with clients: access rights, share modes, open options
 */

use bitflags::bitflags;

bitflags! {
    /// Access rights granted on a handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_EA = 0x0000_0008;
        const WRITE_EA = 0x0000_0010;
        const EXECUTE = 0x0000_0020;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        /// Object-specific rights (process/thread/event) live in the low word
        const SPECIFIC_ALL = 0x0000_FFFF;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;

        const STANDARD_RIGHTS_REQUIRED = Self::DELETE.bits()
            | Self::READ_CONTROL.bits()
            | Self::WRITE_DAC.bits()
            | Self::WRITE_OWNER.bits();
        const STANDARD_RIGHTS_ALL = Self::STANDARD_RIGHTS_REQUIRED.bits() | Self::SYNCHRONIZE.bits();

        /// Rights that need a readable unix descriptor
        const UNIX_READ = Self::READ_DATA.bits() | Self::EXECUTE.bits();
        /// Rights that need a writable unix descriptor
        const UNIX_WRITE = Self::WRITE_DATA.bits() | Self::APPEND_DATA.bits();

        const FILE_ALL_ACCESS = Self::STANDARD_RIGHTS_ALL.bits() | 0x1FF;
        const PROCESS_ALL_ACCESS = Self::STANDARD_RIGHTS_ALL.bits() | 0xFFFF;
        const THREAD_ALL_ACCESS = Self::STANDARD_RIGHTS_ALL.bits() | 0xFFFF;
    }
}

/// How generic rights expand for one object type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericMapping {
    pub read: Access,
    pub write: Access,
    pub execute: Access,
    pub all: Access,
}

impl GenericMapping {
    /// Mapping for objects without type-specific rights
    pub const STANDARD: GenericMapping = GenericMapping {
        read: Access::READ_CONTROL,
        write: Access::READ_CONTROL,
        execute: Access::READ_CONTROL,
        all: Access::STANDARD_RIGHTS_ALL,
    };

    pub const FILE: GenericMapping = GenericMapping {
        read: Access::from_bits_retain(
            Access::READ_CONTROL.bits()
                | Access::READ_DATA.bits()
                | Access::READ_ATTRIBUTES.bits()
                | Access::READ_EA.bits()
                | Access::SYNCHRONIZE.bits(),
        ),
        write: Access::from_bits_retain(
            Access::READ_CONTROL.bits()
                | Access::WRITE_DATA.bits()
                | Access::APPEND_DATA.bits()
                | Access::WRITE_ATTRIBUTES.bits()
                | Access::WRITE_EA.bits()
                | Access::SYNCHRONIZE.bits(),
        ),
        execute: Access::from_bits_retain(
            Access::READ_CONTROL.bits()
                | Access::EXECUTE.bits()
                | Access::READ_ATTRIBUTES.bits()
                | Access::SYNCHRONIZE.bits(),
        ),
        all: Access::FILE_ALL_ACCESS,
    };
}

impl Access {
    const GENERIC: Access = Access::from_bits_retain(
        Access::GENERIC_READ.bits()
            | Access::GENERIC_WRITE.bits()
            | Access::GENERIC_EXECUTE.bits()
            | Access::GENERIC_ALL.bits(),
    );

    /// Replace generic rights with their type-specific expansion
    pub fn map_generic(self, mapping: &GenericMapping) -> Access {
        let mut mapped = self.difference(Self::GENERIC);
        if self.contains(Access::GENERIC_READ) {
            mapped |= mapping.read;
        }
        if self.contains(Access::GENERIC_WRITE) {
            mapped |= mapping.write;
        }
        if self.contains(Access::GENERIC_EXECUTE) {
            mapped |= mapping.execute;
        }
        if self.contains(Access::GENERIC_ALL) {
            mapped |= mapping.all;
        }
        mapped
    }
}

bitflags! {
    /// Share mode declared by an open
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShareMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const DELETE = 0x4;
    }
}

bitflags! {
    /// Create options attached to an open
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileOptions: u32 {
        const DIRECTORY_FILE = 0x0000_0001;
        const WRITE_THROUGH = 0x0000_0002;
        const SEQUENTIAL_ONLY = 0x0000_0004;
        const SYNCHRONOUS_IO_ALERT = 0x0000_0010;
        const SYNCHRONOUS_IO_NONALERT = 0x0000_0020;
        const NON_DIRECTORY_FILE = 0x0000_0040;
        const DELETE_ON_CLOSE = 0x0000_1000;

        const SYNCHRONOUS = Self::SYNCHRONOUS_IO_ALERT.bits() | Self::SYNCHRONOUS_IO_NONALERT.bits();
    }
}

bitflags! {
    /// Unix-side creation flags for an open
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CreateFlags: u32 {
        const CREATE = 0x1;
        const EXCL = 0x2;
        const TRUNC = 0x4;
    }
}

/// Serialize a flag set as its raw `u32` bits, keeping unknown bits
macro_rules! bits_serde {
    ($module:ident, $ty:ty) => {
        pub mod $module {
            use serde::{Deserialize, Deserializer, Serializer};

            pub fn serialize<S: Serializer>(
                value: &$ty,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(value.bits())
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<$ty, D::Error> {
                Ok(<$ty>::from_bits_retain(u32::deserialize(deserializer)?))
            }
        }
    };
}

bits_serde!(create_flags_bits, super::CreateFlags);
bits_serde!(access_bits, super::Access);
bits_serde!(share_bits, super::ShareMode);
bits_serde!(options_bits, super::FileOptions);
