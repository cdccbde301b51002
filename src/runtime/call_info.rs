use std::rc::Rc;

use super::{closure::NativeFn, function::Function, gc::Handle};

/// Status bits of a call frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStatus(u16);

impl CallStatus {
    pub const ALLOW_HOOK: u16 = 1 << 0;
    pub const NATIVE_CALL: u16 = 1 << 1;
    pub const CREATE_FRAME: u16 = 1 << 2;
    pub const DEBUG_HOOK: u16 = 1 << 3;
    /// Reserved; generators are evaluated eagerly.
    pub const YIELD_CALL: u16 = 1 << 4;
    pub const TAIL_CALL: u16 = 1 << 5;
    pub const HOOK_YIELD: u16 = 1 << 6;
    pub const DECONSTRUCTOR_CALL: u16 = 1 << 7;
    pub const CALL_INFO_TRANSFER: u16 = 1 << 8;
    pub const RELEASE_CALL: u16 = 1 << 9;
    pub const CLOSE_CALL: u16 = 1 << 10;

    pub fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub enum CallContext {
    Vm {
        pc: usize,
        trap: bool,
        varargs: u16,
    },
    Native {
        continuation: Option<NativeFn>,
        saved_handler: usize,
        ctx: i64,
    },
}

impl Default for CallContext {
    fn default() -> Self {
        CallContext::Native {
            continuation: None,
            saved_handler: 0,
            ctx: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct YieldContext {
    pub function_index: i32,
    pub yield_count: u32,
    pub return_count: u32,
    pub transfer_start: u16,
    pub transfer_count: u16,
}

/// One activation record. `base` holds the callee, arguments start at
/// `base + 1` and `top` is the end of the frame's reserved window.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub base: usize,
    pub top: usize,
    pub status: CallStatus,
    pub context: CallContext,
    pub yield_context: YieldContext,
    pub expected_returns: u16,
    pub function: Option<Rc<Function>>,
    pub closure: Option<Handle>,
}

impl CallInfo {
    pub fn is_vm(&self) -> bool {
        matches!(self.context, CallContext::Vm { .. })
    }

    pub fn pc(&self) -> usize {
        match self.context {
            CallContext::Vm { pc, .. } => pc,
            CallContext::Native { .. } => 0,
        }
    }

    pub fn set_trap(&mut self) {
        if let CallContext::Vm { trap, .. } = &mut self.context {
            *trap = true;
        }
    }

    /// Line of the instruction that is executing in this frame.
    pub fn current_line(&self) -> Option<u32> {
        let function = self.function.as_ref()?;
        function.line_at(self.pc().saturating_sub(1))
    }

    pub fn vm_init(
        &mut self,
        base: usize,
        top: usize,
        function: Rc<Function>,
        closure: Option<Handle>,
        expected_returns: u16,
    ) {
        self.base = base;
        self.top = top;
        self.status = CallStatus::new(CallStatus::CREATE_FRAME | CallStatus::ALLOW_HOOK);
        self.context = CallContext::Vm {
            pc: 0,
            trap: false,
            varargs: 0,
        };
        self.yield_context = YieldContext::default();
        self.expected_returns = expected_returns;
        self.function = Some(function);
        self.closure = closure;
    }

    /// Initialises a frame for a native call, including re-entrant ones made
    /// on behalf of metamethods, conversions and module entry execution.
    pub fn entry_native_init(
        &mut self,
        base: usize,
        top: usize,
        closure: Option<Handle>,
        saved_handler: usize,
        expected_returns: u16,
    ) {
        self.base = base;
        self.top = top;
        self.status = CallStatus::new(CallStatus::NATIVE_CALL | CallStatus::CREATE_FRAME);
        self.context = CallContext::Native {
            continuation: None,
            saved_handler,
            ctx: 0,
        };
        self.yield_context = YieldContext::default();
        self.expected_returns = expected_returns;
        self.function = None;
        self.closure = closure;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let mut status = CallStatus::new(CallStatus::CREATE_FRAME);
        status.insert(CallStatus::TAIL_CALL);
        status.remove(CallStatus::CREATE_FRAME);

        assert!(status.contains(CallStatus::TAIL_CALL));
        assert!(!status.contains(CallStatus::CREATE_FRAME));
    }

    #[test]
    fn test_trap_only_on_vm_frames() {
        let mut native = CallInfo::default();
        native.entry_native_init(0, 20, None, 0, 0);
        native.set_trap();

        let mut vm = CallInfo::default();
        vm.vm_init(1, 10, Rc::new(Function::default()), None, 1);
        vm.set_trap();

        assert!(!native.is_vm());
        assert!(matches!(vm.context, CallContext::Vm { trap: true, .. }));
    }
}
