//! Engine array classes
//!
//! Every engine array carries a class id that determines how its data
//! buffer is laid out. The numeric codes are the ones the engine's C API
//! uses (`mxClassID`).

use std::fmt;

/// Element type tag of an engine array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MxClass {
    /// Class could not be determined
    Unknown = 0,
    /// Cell array (elements are arrays)
    Cell = 1,
    /// Struct array
    Struct = 2,
    /// Logical (one byte per element)
    Logical = 3,
    /// Character data (UTF-16 code units)
    Char = 4,
    /// Reserved
    Void = 5,
    /// 64-bit float
    Double = 6,
    /// 32-bit float
    Single = 7,
    /// Signed 8-bit integer
    Int8 = 8,
    /// Unsigned 8-bit integer
    UInt8 = 9,
    /// Signed 16-bit integer
    Int16 = 10,
    /// Unsigned 16-bit integer
    UInt16 = 11,
    /// Signed 32-bit integer
    Int32 = 12,
    /// Unsigned 32-bit integer
    UInt32 = 13,
    /// Signed 64-bit integer
    Int64 = 14,
    /// Unsigned 64-bit integer
    UInt64 = 15,
    /// Function handle
    Function = 16,
}

impl MxClass {
    /// Map a raw class id to a class; unrecognised ids become `Unknown`.
    pub fn from_id(id: i32) -> Self {
        match id {
            1 => MxClass::Cell,
            2 => MxClass::Struct,
            3 => MxClass::Logical,
            4 => MxClass::Char,
            5 => MxClass::Void,
            6 => MxClass::Double,
            7 => MxClass::Single,
            8 => MxClass::Int8,
            9 => MxClass::UInt8,
            10 => MxClass::Int16,
            11 => MxClass::UInt16,
            12 => MxClass::Int32,
            13 => MxClass::UInt32,
            14 => MxClass::Int64,
            15 => MxClass::UInt64,
            16 => MxClass::Function,
            _ => MxClass::Unknown,
        }
    }

    /// Raw class id
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Size in bytes of one element of a flat data buffer.
    ///
    /// Container classes report the size of an element handle.
    pub fn element_size(self) -> usize {
        match self {
            MxClass::Logical | MxClass::Int8 | MxClass::UInt8 => 1,
            MxClass::Char | MxClass::Int16 | MxClass::UInt16 => 2,
            MxClass::Single | MxClass::Int32 | MxClass::UInt32 => 4,
            MxClass::Double | MxClass::Int64 | MxClass::UInt64 => 8,
            MxClass::Cell | MxClass::Struct | MxClass::Function => std::mem::size_of::<usize>(),
            MxClass::Unknown | MxClass::Void => 0,
        }
    }

    /// The engine-side class name (what `class(x)` returns)
    pub fn name(self) -> &'static str {
        match self {
            MxClass::Unknown => "unknown",
            MxClass::Cell => "cell",
            MxClass::Struct => "struct",
            MxClass::Logical => "logical",
            MxClass::Char => "char",
            MxClass::Void => "void",
            MxClass::Double => "double",
            MxClass::Single => "single",
            MxClass::Int8 => "int8",
            MxClass::UInt8 => "uint8",
            MxClass::Int16 => "int16",
            MxClass::UInt16 => "uint16",
            MxClass::Int32 => "int32",
            MxClass::UInt32 => "uint32",
            MxClass::Int64 => "int64",
            MxClass::UInt64 => "uint64",
            MxClass::Function => "function_handle",
        }
    }

    /// Parse a class from its engine-side name
    pub fn from_name(s: &str) -> Option<Self> {
        let class = match s {
            "cell" => MxClass::Cell,
            "struct" => MxClass::Struct,
            "logical" => MxClass::Logical,
            "char" => MxClass::Char,
            "double" => MxClass::Double,
            "single" => MxClass::Single,
            "int8" => MxClass::Int8,
            "uint8" => MxClass::UInt8,
            "int16" => MxClass::Int16,
            "uint16" => MxClass::UInt16,
            "int32" => MxClass::Int32,
            "uint32" => MxClass::UInt32,
            "int64" => MxClass::Int64,
            "uint64" => MxClass::UInt64,
            "function_handle" => MxClass::Function,
            _ => return None,
        };
        Some(class)
    }

    /// Check if this is an integer class
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            MxClass::Int8
                | MxClass::UInt8
                | MxClass::Int16
                | MxClass::UInt16
                | MxClass::Int32
                | MxClass::UInt32
                | MxClass::Int64
                | MxClass::UInt64
        )
    }

    /// Check if this is a floating point class
    pub fn is_float(self) -> bool {
        matches!(self, MxClass::Double | MxClass::Single)
    }

    /// Check if this is a numeric class
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Check if arrays of this class keep their elements in a flat buffer
    pub fn has_flat_data(self) -> bool {
        self.is_numeric() || matches!(self, MxClass::Logical | MxClass::Char)
    }
}

impl fmt::Display for MxClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
