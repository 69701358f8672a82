//! The `OpCode` instruction set (spec §4.D).
//!
//! Each variant is a single byte; some carry fixed-width operands that
//! immediately follow it in [`super::Chunk::code`] — the chunk's code is a
//! plain `Vec<u8>` (spec §3: "a code array (bytes)"), not a `Vec<OpCode>`.
//! `operand_len` tells the compiler (when patching jumps) and the
//! interpreter (when advancing `ip`) how many operand bytes follow.

/// A single VM instruction. `#[repr(u8)]` so `op as u8` is the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // --- stack ---
    Pop = 0,
    Dup = 1,
    Swap = 2,

    // --- literals / constants ---
    LoadConst = 10, // u16 const index
    LoadNil = 11,
    LoadTrue = 12,
    LoadFalse = 13,

    // --- arithmetic ---
    Add = 20,
    Sub = 21,
    Mul = 22,
    Div = 23,
    Mod = 24,
    Neg = 25,

    // --- comparison ---
    Eq = 30,
    NotEq = 31,
    Lt = 32,
    Le = 33,
    Gt = 34,
    Ge = 35,

    // --- logical ---
    Not = 40,

    // --- control flow ---
    Jump = 50,         // u16 absolute target
    JumpIfFalse = 51,  // u16 absolute target; pops condition
    Loop = 52,         // u16 absolute target (backward jump)

    // --- variables ---
    GetLocal = 60,      // u8 slot
    SetLocal = 61,      // u8 slot
    GetGlobal = 62,     // u16 name const index
    SetGlobal = 63,     // u16 name const index
    DefineGlobal = 64,  // u16 name const index
    GetUpvalue = 65,    // u8 upvalue index

    // --- calls ---
    Call = 70,    // u8 argc
    Invoke = 71,  // u16 name const index, u8 argc
    Return = 72,

    // --- containers ---
    NewArray = 80,  // u16 element count
    NewMap = 81,    // u16 pair count
    GetIndex = 82,
    SetIndex = 83,

    // --- exceptions ---
    Throw = 90,
    PushHandler = 91,  // u16 catch target, u16 finally target (0 = absent)
    PopHandler = 92,
    EndFinally = 93,

    // --- OOP ---
    Class = 100,       // u16 name const index
    Inherit = 101,
    Method = 102,      // u16 name const index
    GetProperty = 103, // u16 name const index
    SetProperty = 104, // u16 name const index
    GetSuper = 105,    // u16 name const index

    // --- closures ---
    MakeClosure = 110, // u16 function-proto const index

    // --- termination ---
    Halt = 255,
}

impl OpCode {
    /// Number of operand bytes immediately following this opcode byte.
    pub fn operand_len(self) -> usize {
        use OpCode::*;
        match self {
            LoadConst | GetGlobal | SetGlobal | DefineGlobal | Jump | JumpIfFalse | Loop | NewArray
            | NewMap | Class | Method | GetProperty | SetProperty | GetSuper | MakeClosure => 2,
            Invoke => 3, // u16 name + u8 argc
            PushHandler => 4, // u16 + u16
            GetLocal | SetLocal | Call | GetUpvalue => 1,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Pop => "POP",
            Dup => "DUP",
            Swap => "SWAP",
            LoadConst => "LOAD_CONST",
            LoadNil => "LOAD_NIL",
            LoadTrue => "LOAD_TRUE",
            LoadFalse => "LOAD_FALSE",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Neg => "NEG",
            Eq => "EQ",
            NotEq => "NEQ",
            Lt => "LT",
            Le => "LE",
            Gt => "GT",
            Ge => "GE",
            Not => "NOT",
            Jump => "JUMP",
            JumpIfFalse => "JUMP_IF_FALSE",
            Loop => "LOOP",
            GetLocal => "GET_LOCAL",
            SetLocal => "SET_LOCAL",
            GetGlobal => "GET_GLOBAL",
            SetGlobal => "SET_GLOBAL",
            DefineGlobal => "DEFINE_GLOBAL",
            GetUpvalue => "GET_UPVALUE",
            Call => "CALL",
            Invoke => "INVOKE",
            Return => "RETURN",
            NewArray => "NEW_ARRAY",
            NewMap => "NEW_MAP",
            GetIndex => "GET_INDEX",
            SetIndex => "SET_INDEX",
            Throw => "THROW",
            PushHandler => "PUSH_HANDLER",
            PopHandler => "POP_HANDLER",
            EndFinally => "END_FINALLY",
            Class => "CLASS",
            Inherit => "INHERIT",
            Method => "METHOD",
            GetProperty => "GET_PROPERTY",
            SetProperty => "SET_PROPERTY",
            GetSuper => "GET_SUPER",
            MakeClosure => "MAKE_CLOSURE",
            Halt => "HALT",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        use OpCode::*;
        Ok(match byte {
            0 => Pop,
            1 => Dup,
            2 => Swap,
            10 => LoadConst,
            11 => LoadNil,
            12 => LoadTrue,
            13 => LoadFalse,
            20 => Add,
            21 => Sub,
            22 => Mul,
            23 => Div,
            24 => Mod,
            25 => Neg,
            30 => Eq,
            31 => NotEq,
            32 => Lt,
            33 => Le,
            34 => Gt,
            35 => Ge,
            40 => Not,
            50 => Jump,
            51 => JumpIfFalse,
            52 => Loop,
            60 => GetLocal,
            61 => SetLocal,
            62 => GetGlobal,
            63 => SetGlobal,
            64 => DefineGlobal,
            65 => GetUpvalue,
            70 => Call,
            71 => Invoke,
            72 => Return,
            80 => NewArray,
            81 => NewMap,
            82 => GetIndex,
            83 => SetIndex,
            90 => Throw,
            91 => PushHandler,
            92 => PopHandler,
            93 => EndFinally,
            100 => Class,
            101 => Inherit,
            102 => Method,
            103 => GetProperty,
            104 => SetProperty,
            105 => GetSuper,
            110 => MakeClosure,
            255 => Halt,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_its_byte() {
        let all = [
            OpCode::Pop, OpCode::Dup, OpCode::Swap, OpCode::LoadConst, OpCode::LoadNil,
            OpCode::LoadTrue, OpCode::LoadFalse, OpCode::Add, OpCode::Sub, OpCode::Mul,
            OpCode::Div, OpCode::Mod, OpCode::Neg, OpCode::Eq, OpCode::NotEq, OpCode::Lt,
            OpCode::Le, OpCode::Gt, OpCode::Ge, OpCode::Not, OpCode::Jump, OpCode::JumpIfFalse,
            OpCode::Loop, OpCode::GetLocal, OpCode::SetLocal, OpCode::GetGlobal, OpCode::SetGlobal,
            OpCode::DefineGlobal, OpCode::GetUpvalue, OpCode::Call, OpCode::Invoke, OpCode::Return,
            OpCode::NewArray, OpCode::NewMap, OpCode::GetIndex, OpCode::SetIndex, OpCode::Throw,
            OpCode::PushHandler, OpCode::PopHandler, OpCode::EndFinally, OpCode::Class, OpCode::Inherit,
            OpCode::Method, OpCode::GetProperty, OpCode::SetProperty, OpCode::GetSuper,
            OpCode::MakeClosure, OpCode::Halt,
        ];
        for op in all {
            assert_eq!(OpCode::try_from(op as u8), Ok(op));
        }
    }
}
