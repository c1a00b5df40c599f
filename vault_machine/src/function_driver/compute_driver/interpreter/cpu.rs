use crate::memory_domain::AddressSpace;
use iced_x86::{ConditionCode, Instruction, Mnemonic, OpKind, Register as IcedRegister};
use vault_commons::FaultKind;

type Step<T> = Result<T, FaultKind>;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Flags {
    pub carry: bool,
    pub zero: bool,
    pub sign: bool,
    pub overflow: bool,
    pub parity: bool,
}

/// Architectural state the interpreter models
#[derive(Clone, Debug, Default)]
pub(crate) struct Cpu {
    pub gpr: [u64; 16],
    pub xmm: [u128; 16],
    pub rip: u64,
    pub flags: Flags,
}

fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn sign_bit(value: u64, size: usize) -> bool {
    (value >> (size * 8 - 1)) & 1 == 1
}

fn sign_extend(value: u64, size: usize) -> u64 {
    let shift = 64 - size as u32 * 8;
    (((value << shift) as i64) >> shift) as u64
}

fn unsupported(instruction: &Instruction) -> FaultKind {
    FaultKind::UnsupportedInstruction {
        address: instruction.ip(),
        mnemonic: format!("{:?}", instruction.mnemonic()).to_lowercase(),
    }
}

fn load(memory: &AddressSpace, address: u64, size: usize) -> Step<u64> {
    let bytes = memory
        .read(address, size)
        .map_err(|_| FaultKind::InvalidRead(address))?;
    let mut value = [0u8; 8];
    value[..size].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(value))
}

fn store(memory: &mut AddressSpace, address: u64, value: u64, size: usize) -> Step<()> {
    memory
        .write(address, &value.to_le_bytes()[..size])
        .map_err(|_| FaultKind::InvalidWrite(address))
}

impl Cpu {
    /// Index into `gpr` and bit position of a general purpose register
    fn gpr_slot(register: IcedRegister) -> Option<(usize, u32)> {
        if !register.is_gpr() {
            return None;
        }
        let shift = match register {
            IcedRegister::AH | IcedRegister::CH | IcedRegister::DH | IcedRegister::BH => 8,
            _ => 0,
        };
        Some((register.full_register().number(), shift))
    }

    fn get_gpr(&self, instruction: &Instruction, register: IcedRegister) -> Step<u64> {
        let (index, shift) = Self::gpr_slot(register).ok_or_else(|| unsupported(instruction))?;
        Ok((self.gpr[index] >> shift) & mask(register.size()))
    }

    fn set_gpr(&mut self, instruction: &Instruction, register: IcedRegister, value: u64) -> Step<()> {
        let (index, shift) = Self::gpr_slot(register).ok_or_else(|| unsupported(instruction))?;
        let size = register.size();
        self.gpr[index] = match size {
            8 => value,
            // 32 bit writes clear the upper half
            4 => value & mask(4),
            _ => {
                let field = mask(size) << shift;
                (self.gpr[index] & !field) | ((value << shift) & field)
            }
        };
        Ok(())
    }

    fn xmm_index(instruction: &Instruction, register: IcedRegister) -> Step<usize> {
        if register.is_xmm() && register.number() < 16 {
            Ok(register.number())
        } else {
            Err(unsupported(instruction))
        }
    }

    fn memory_address(&self, instruction: &Instruction) -> Step<u64> {
        if matches!(
            instruction.memory_segment(),
            IcedRegister::FS | IcedRegister::GS
        ) {
            return Err(unsupported(instruction));
        }
        let base = instruction.memory_base();
        // the decoder already resolved rip relative operands to absolute addresses
        if base == IcedRegister::RIP {
            return Ok(instruction.memory_displacement64());
        }
        let mut address = instruction.memory_displacement64();
        if base != IcedRegister::None {
            address = address.wrapping_add(self.get_gpr(instruction, base)?);
        }
        let index = instruction.memory_index();
        if index != IcedRegister::None {
            let scaled = self
                .get_gpr(instruction, index)?
                .wrapping_mul(u64::from(instruction.memory_index_scale()));
            address = address.wrapping_add(scaled);
        }
        Ok(address)
    }

    fn operand_size(instruction: &Instruction, operand: u32) -> usize {
        match instruction.op_kind(operand) {
            OpKind::Register => instruction.op_register(operand).size(),
            OpKind::Memory => instruction.memory_size().size(),
            _ if operand > 0 => Self::operand_size(instruction, 0),
            _ => 8,
        }
    }

    fn read_operand(
        &self,
        instruction: &Instruction,
        operand: u32,
        memory: &AddressSpace,
    ) -> Step<u64> {
        match instruction.op_kind(operand) {
            OpKind::Register => self.get_gpr(instruction, instruction.op_register(operand)),
            OpKind::Memory => load(
                memory,
                self.memory_address(instruction)?,
                instruction.memory_size().size(),
            ),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(instruction.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(instruction.immediate(operand)),
            _ => Err(unsupported(instruction)),
        }
    }

    fn write_operand(
        &mut self,
        instruction: &Instruction,
        operand: u32,
        value: u64,
        memory: &mut AddressSpace,
    ) -> Step<()> {
        match instruction.op_kind(operand) {
            OpKind::Register => self.set_gpr(instruction, instruction.op_register(operand), value),
            OpKind::Memory => store(
                memory,
                self.memory_address(instruction)?,
                value,
                instruction.memory_size().size(),
            ),
            _ => Err(unsupported(instruction)),
        }
    }

    fn read_vector(&self, instruction: &Instruction, operand: u32, memory: &AddressSpace) -> Step<u128> {
        match instruction.op_kind(operand) {
            OpKind::Register => {
                Ok(self.xmm[Self::xmm_index(instruction, instruction.op_register(operand))?])
            }
            OpKind::Memory => {
                let address = self.memory_address(instruction)?;
                let bytes = memory
                    .read(address, 16)
                    .map_err(|_| FaultKind::InvalidRead(address))?;
                let mut value = [0u8; 16];
                value.copy_from_slice(&bytes);
                Ok(u128::from_le_bytes(value))
            }
            _ => Err(unsupported(instruction)),
        }
    }

    fn write_vector(
        &mut self,
        instruction: &Instruction,
        operand: u32,
        value: u128,
        memory: &mut AddressSpace,
    ) -> Step<()> {
        match instruction.op_kind(operand) {
            OpKind::Register => {
                self.xmm[Self::xmm_index(instruction, instruction.op_register(operand))?] = value;
                Ok(())
            }
            OpKind::Memory => {
                let address = self.memory_address(instruction)?;
                memory
                    .write(address, &value.to_le_bytes())
                    .map_err(|_| FaultKind::InvalidWrite(address))
            }
            _ => Err(unsupported(instruction)),
        }
    }

    fn push(&mut self, value: u64, memory: &mut AddressSpace) -> Step<()> {
        let rsp = self.gpr[4].wrapping_sub(8);
        store(memory, rsp, value, 8)?;
        self.gpr[4] = rsp;
        Ok(())
    }

    fn pop(&mut self, memory: &AddressSpace) -> Step<u64> {
        let value = load(memory, self.gpr[4], 8)?;
        self.gpr[4] = self.gpr[4].wrapping_add(8);
        Ok(value)
    }

    fn set_result_flags(&mut self, result: u64, size: usize) {
        self.flags.zero = result & mask(size) == 0;
        self.flags.sign = sign_bit(result, size);
        self.flags.parity = (result as u8).count_ones() % 2 == 0;
    }

    fn add(&mut self, left: u64, right: u64, carry_in: bool, size: usize) -> u64 {
        let (left, right) = (left & mask(size), right & mask(size));
        let wide = left as u128 + right as u128 + carry_in as u128;
        let result = wide as u64 & mask(size);
        self.flags.carry = wide > mask(size) as u128;
        self.flags.overflow = sign_bit((left ^ result) & (right ^ result), size);
        self.set_result_flags(result, size);
        result
    }

    fn sub(&mut self, left: u64, right: u64, borrow_in: bool, size: usize) -> u64 {
        let (left, right) = (left & mask(size), right & mask(size));
        let result = left.wrapping_sub(right).wrapping_sub(borrow_in as u64) & mask(size);
        self.flags.carry = (left as u128) < right as u128 + borrow_in as u128;
        self.flags.overflow = sign_bit((left ^ right) & (left ^ result), size);
        self.set_result_flags(result, size);
        result
    }

    fn logic(&mut self, result: u64, size: usize) -> u64 {
        self.flags.carry = false;
        self.flags.overflow = false;
        self.set_result_flags(result, size);
        result & mask(size)
    }

    fn shift(&mut self, mnemonic: Mnemonic, value: u64, count: u32, size: usize) -> u64 {
        let bits = size as u32 * 8;
        let value = value & mask(size);
        let result = match mnemonic {
            Mnemonic::Shl | Mnemonic::Sal => {
                self.flags.carry = count <= bits && (value >> (bits - count)) & 1 == 1;
                value.checked_shl(count).unwrap_or(0)
            }
            Mnemonic::Shr => {
                self.flags.carry = (value >> (count - 1)) & 1 == 1;
                value.checked_shr(count).unwrap_or(0)
            }
            Mnemonic::Sar => {
                let signed = sign_extend(value, size) as i64;
                self.flags.carry = (signed >> (count - 1).min(63)) & 1 == 1;
                (signed >> count.min(63)) as u64
            }
            Mnemonic::Rol => {
                let count = count % bits;
                let rotated = (value << count | value.checked_shr(bits - count).unwrap_or(0)) & mask(size);
                self.flags.carry = rotated & 1 == 1;
                return rotated;
            }
            // ror
            _ => {
                let count = count % bits;
                let rotated = (value >> count | value.checked_shl(bits - count).unwrap_or(0)) & mask(size);
                self.flags.carry = sign_bit(rotated, size);
                return rotated;
            }
        } & mask(size);
        self.flags.overflow = count == 1 && sign_bit(result, size) != self.flags.carry;
        self.set_result_flags(result, size);
        result
    }

    pub fn condition(&self, code: ConditionCode) -> bool {
        let flags = self.flags;
        match code {
            ConditionCode::None => true,
            ConditionCode::o => flags.overflow,
            ConditionCode::no => !flags.overflow,
            ConditionCode::b => flags.carry,
            ConditionCode::ae => !flags.carry,
            ConditionCode::e => flags.zero,
            ConditionCode::ne => !flags.zero,
            ConditionCode::be => flags.carry || flags.zero,
            ConditionCode::a => !flags.carry && !flags.zero,
            ConditionCode::s => flags.sign,
            ConditionCode::ns => !flags.sign,
            ConditionCode::p => flags.parity,
            ConditionCode::np => !flags.parity,
            ConditionCode::l => flags.sign != flags.overflow,
            ConditionCode::ge => flags.sign == flags.overflow,
            ConditionCode::le => flags.zero || flags.sign != flags.overflow,
            ConditionCode::g => !flags.zero && flags.sign == flags.overflow,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Execute one decoded instruction, `rip` has to point past it already.
    pub fn execute(&mut self, instruction: &Instruction, memory: &mut AddressSpace) -> Step<()> {
        let mnemonic = instruction.mnemonic();
        match mnemonic {
            Mnemonic::Nop | Mnemonic::Endbr64 => (),
            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = self.read_operand(instruction, 1, memory)?;
                self.write_operand(instruction, 0, value, memory)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let value = self.read_operand(instruction, 1, memory)?;
                let extended = sign_extend(value, Self::operand_size(instruction, 1));
                self.write_operand(instruction, 0, extended, memory)?;
            }
            Mnemonic::Lea => {
                let address = self.memory_address(instruction)?;
                self.write_operand(instruction, 0, address, memory)?;
            }
            Mnemonic::Xchg => {
                let left = self.read_operand(instruction, 0, memory)?;
                let right = self.read_operand(instruction, 1, memory)?;
                self.write_operand(instruction, 0, right, memory)?;
                self.write_operand(instruction, 1, left, memory)?;
            }
            Mnemonic::Add | Mnemonic::Adc | Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
                let size = Self::operand_size(instruction, 0);
                let left = self.read_operand(instruction, 0, memory)?;
                let right = self.read_operand(instruction, 1, memory)?;
                let carry = self.flags.carry;
                let result = match mnemonic {
                    Mnemonic::Add => self.add(left, right, false, size),
                    Mnemonic::Adc => self.add(left, right, carry, size),
                    Mnemonic::Sbb => self.sub(left, right, carry, size),
                    _ => self.sub(left, right, false, size),
                };
                if mnemonic != Mnemonic::Cmp {
                    self.write_operand(instruction, 0, result, memory)?;
                }
            }
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
                let size = Self::operand_size(instruction, 0);
                let left = self.read_operand(instruction, 0, memory)?;
                let right = self.read_operand(instruction, 1, memory)?;
                let result = match mnemonic {
                    Mnemonic::Or => self.logic(left | right, size),
                    Mnemonic::Xor => self.logic(left ^ right, size),
                    _ => self.logic(left & right, size),
                };
                if mnemonic != Mnemonic::Test {
                    self.write_operand(instruction, 0, result, memory)?;
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let size = Self::operand_size(instruction, 0);
                let value = self.read_operand(instruction, 0, memory)?;
                // carry is preserved by inc and dec
                let carry = self.flags.carry;
                let result = if mnemonic == Mnemonic::Inc {
                    self.add(value, 1, false, size)
                } else {
                    self.sub(value, 1, false, size)
                };
                self.flags.carry = carry;
                self.write_operand(instruction, 0, result, memory)?;
            }
            Mnemonic::Neg => {
                let size = Self::operand_size(instruction, 0);
                let value = self.read_operand(instruction, 0, memory)?;
                let result = self.sub(0, value, false, size);
                self.write_operand(instruction, 0, result, memory)?;
            }
            Mnemonic::Not => {
                let value = self.read_operand(instruction, 0, memory)?;
                self.write_operand(instruction, 0, !value, memory)?;
            }
            Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror => {
                let size = Self::operand_size(instruction, 0);
                let count_mask = if size == 8 { 0x3F } else { 0x1F };
                let count = (self.read_operand(instruction, 1, memory)? & count_mask) as u32;
                if count != 0 {
                    let value = self.read_operand(instruction, 0, memory)?;
                    let result = self.shift(mnemonic, value, count, size);
                    self.write_operand(instruction, 0, result, memory)?;
                }
            }
            Mnemonic::Imul if instruction.op_count() >= 2 => {
                let size = Self::operand_size(instruction, 0);
                let (left, right) = if instruction.op_count() == 3 {
                    (
                        self.read_operand(instruction, 1, memory)?,
                        self.read_operand(instruction, 2, memory)?,
                    )
                } else {
                    (
                        self.read_operand(instruction, 0, memory)?,
                        self.read_operand(instruction, 1, memory)?,
                    )
                };
                let wide = sign_extend(left & mask(size), size) as i64 as i128
                    * sign_extend(right & mask(size), size) as i64 as i128;
                let result = wide as u64 & mask(size);
                let truncated = sign_extend(result, size) as i64 as i128;
                self.flags.carry = truncated != wide;
                self.flags.overflow = truncated != wide;
                self.write_operand(instruction, 0, result, memory)?;
            }
            Mnemonic::Cdqe => self.gpr[0] = sign_extend(self.gpr[0], 4),
            Mnemonic::Cdq => {
                self.gpr[2] = if sign_bit(self.gpr[0], 4) { mask(4) } else { 0 };
            }
            Mnemonic::Cqo => {
                self.gpr[2] = if sign_bit(self.gpr[0], 8) { u64::MAX } else { 0 };
            }
            Mnemonic::Push => {
                let value = self.read_operand(instruction, 0, memory)?;
                self.push(value, memory)?;
            }
            Mnemonic::Pop => {
                let value = self.pop(memory)?;
                self.write_operand(instruction, 0, value, memory)?;
            }
            Mnemonic::Leave => {
                self.gpr[4] = self.gpr[5];
                self.gpr[5] = self.pop(memory)?;
            }
            Mnemonic::Call => {
                let target = self.read_operand(instruction, 0, memory)?;
                self.push(self.rip, memory)?;
                self.rip = target;
            }
            Mnemonic::Ret => {
                self.rip = self.pop(memory)?;
                if instruction.op_count() == 1 {
                    self.gpr[4] = self.gpr[4].wrapping_add(instruction.immediate(0));
                }
            }
            Mnemonic::Jmp => self.rip = self.read_operand(instruction, 0, memory)?,
            _ if instruction.is_jcc_short_or_near() => {
                if self.condition(instruction.condition_code()) {
                    self.rip = instruction.near_branch_target();
                }
            }
            Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg => {
                let value = if self.condition(instruction.condition_code()) {
                    self.read_operand(instruction, 1, memory)?
                } else {
                    // a 32 bit cmov zero extends its destination even when not taken
                    self.read_operand(instruction, 0, memory)?
                };
                self.write_operand(instruction, 0, value, memory)?;
            }
            Mnemonic::Seto
            | Mnemonic::Setno
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setbe
            | Mnemonic::Seta
            | Mnemonic::Sets
            | Mnemonic::Setns
            | Mnemonic::Setp
            | Mnemonic::Setnp
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg => {
                let value = self.condition(instruction.condition_code()) as u64;
                self.write_operand(instruction, 0, value, memory)?;
            }
            Mnemonic::Movups
            | Mnemonic::Movupd
            | Mnemonic::Movdqu
            | Mnemonic::Movaps
            | Mnemonic::Movapd
            | Mnemonic::Movdqa => {
                let value = self.read_vector(instruction, 1, memory)?;
                self.write_vector(instruction, 0, value, memory)?;
            }
            Mnemonic::Pxor | Mnemonic::Xorps | Mnemonic::Xorpd => {
                let left = self.read_vector(instruction, 0, memory)?;
                let right = self.read_vector(instruction, 1, memory)?;
                self.write_vector(instruction, 0, left ^ right, memory)?;
            }
            _ => return Err(unsupported(instruction)),
        }
        Ok(())
    }
}
