//! Append-only bytecode buffer with a jump patch list.

use crate::bytecode::instruction::Opcode;

/// Handle to a forward jump whose target is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpLabel(usize);

#[derive(Debug, Clone)]
struct Patch {
    /// Position of the operand byte to fill in
    operand: usize,
    /// Bound target address
    target: Option<usize>,
}

/// A jump target lies too far ahead for a one-byte operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTooFar {
    pub from: usize,
    pub to: usize,
}

/// Compiled bytecode of one function.
#[derive(Debug, Clone, Default)]
pub struct Code {
    bytes: Vec<u8>,
    patches: Vec<Patch>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            patches: Vec::new(),
        }
    }

    pub fn add_opcode(&mut self, opcode: Opcode) {
        self.bytes.push(opcode as u8);
    }

    pub fn add_arg(&mut self, arg: u8) {
        self.bytes.push(arg);
    }

    /// Overwrite a previously written operand.
    pub fn set_arg(&mut self, pos: usize, arg: u8) {
        self.bytes[pos] = arg;
    }

    /// Address of the last byte written.
    pub fn this_instruction_address(&self) -> usize {
        self.bytes.len().saturating_sub(1)
    }

    /// Address the next written byte will get.
    pub fn next_instruction_address(&self) -> usize {
        self.bytes.len()
    }

    /// Append another code fragment verbatim.
    pub fn append(&mut self, other: &Code) {
        self.bytes.extend_from_slice(&other.bytes);
    }

    /// Emit a `Jump` or `JumpIfNot` with a placeholder operand.
    pub fn add_jump(&mut self, opcode: Opcode) -> JumpLabel {
        debug_assert!(matches!(opcode, Opcode::Jump | Opcode::JumpIfNot));
        self.add_opcode(opcode);
        self.add_arg(0);
        self.patches.push(Patch {
            operand: self.this_instruction_address(),
            target: None,
        });
        JumpLabel(self.patches.len() - 1)
    }

    /// Make the jump land at the next instruction to be written.
    pub fn bind(&mut self, label: JumpLabel) {
        let target = self.next_instruction_address();
        self.patches[label.0].target = Some(target);
    }

    /// Write every bound jump offset. Offsets count bytes from the byte
    /// following the operand.
    pub fn resolve_patches(&mut self) -> Result<(), JumpTooFar> {
        for patch in self.patches.drain(..) {
            let Some(target) = patch.target else {
                continue;
            };
            let from = patch.operand + 1;
            let offset = target
                .checked_sub(from)
                .and_then(|d| u8::try_from(d).ok())
                .ok_or(JumpTooFar { from, to: target })?;
            self.bytes[patch.operand] = offset;
        }
        Ok(())
    }

    pub fn has_pending_patches(&self) -> bool {
        !self.patches.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Iterate over instruction start addresses.
    pub fn instruction_addresses(&self) -> InstructionAddresses<'_> {
        InstructionAddresses { code: self, pos: 0 }
    }
}

pub struct InstructionAddresses<'a> {
    code: &'a Code,
    pos: usize,
}

impl Iterator for InstructionAddresses<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let pos = self.pos;
        let byte = *self.code.bytes.get(pos)?;
        // undecodable bytes advance by one
        self.pos += Opcode::from_u8(byte).map_or(1, Opcode::len);
        Some(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_addresses() {
        let mut code = Code::new();
        assert_eq!(code.next_instruction_address(), 0);
        code.add_opcode(Opcode::LoadStatic);
        code.add_arg(3);
        assert_eq!(code.this_instruction_address(), 1);
        assert_eq!(code.next_instruction_address(), 2);
        code.set_arg(1, 7);
        assert_eq!(code.bytes(), &[Opcode::LoadStatic as u8, 7]);
    }

    #[test]
    fn test_patch_list_resolves_forward_jumps() {
        let mut code = Code::new();
        let else_jump = code.add_jump(Opcode::JumpIfNot);
        code.add_opcode(Opcode::Noop);
        let end_jump = code.add_jump(Opcode::Jump);
        code.bind(else_jump);
        code.add_opcode(Opcode::Noop);
        code.add_opcode(Opcode::Noop);
        code.bind(end_jump);
        assert!(code.has_pending_patches());
        code.resolve_patches().unwrap();

        // JumpIfNot at 0, operand at 1 -> target 5 (after Jump's operand at 4)
        assert_eq!(code.bytes()[1], 3);
        // Jump at 3, operand at 4 -> target 7
        assert_eq!(code.bytes()[4], 2);
        assert!(!code.has_pending_patches());
    }

    #[test]
    fn test_jump_too_far() {
        let mut code = Code::new();
        let jump = code.add_jump(Opcode::Jump);
        for _ in 0..300 {
            code.add_opcode(Opcode::Noop);
        }
        code.bind(jump);
        assert_eq!(
            code.resolve_patches(),
            Err(JumpTooFar { from: 2, to: 302 })
        );
    }

    #[test]
    fn test_instruction_addresses() {
        let mut code = Code::new();
        code.add_opcode(Opcode::Add32);
        code.add_opcode(Opcode::Call);
        code.add_arg(1);
        code.add_arg(2);
        code.add_opcode(Opcode::DecRef);
        code.add_arg(0);
        assert_eq!(code.instruction_addresses().collect::<Vec<_>>(), vec![0, 1, 4]);
    }
}
