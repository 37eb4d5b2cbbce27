/// Mode-transition trampolines.
///
/// These are the only instructions that execute while neither mode's
/// Rust code can run: the moment CR0.PE flips, the fault handlers, the
/// stack conventions, and even the instruction decoding width are in
/// flux. Everything here runs under `cli`, touches only the statics
/// below, and ends with a far jump that re-establishes a coherent
/// CS/EIP before returning to the caller.
///
/// The struct offsets encode the `repr(C)` layout of
/// `host::SwitchFrame` (gdt_limit +0, gdt_base +4, idt_limit +8,
/// idt_base +12, code_sel +16, data_sel +18, code16_sel +20,
/// data16_sel +22, tss_sel +24, ldt_sel +26) and `host::RegisterBlock`
/// (eax +0 .. ebp +24, ds +28, es +30, flags +32).
use core::arch::global_asm;

use crate::host::{RealPtr, RegisterBlock, SwitchFrame};

extern "C" {
    /// Raw CR0.PE entry: load the frame's tables, set PE, reload
    /// segments. Caller holds `cli` and has A20 settled.
    pub fn boot_raw_enter_pmode(frame: *const SwitchFrame);
    /// Raw CR0.PE exit: 16-bit compatible segments, clear PE, restore
    /// real-mode segment registers.
    pub fn boot_raw_leave_pmode(frame: *const SwitchFrame);
    /// Real-mode software interrupt with a caller-supplied register
    /// image. Real mode only.
    pub fn boot_real_int(vector: u32, regs: *mut RegisterBlock);
    /// Real-mode far call (XMS entry style). Real mode only.
    pub fn boot_real_far_call(segment: u32, offset: u32, regs: *mut RegisterBlock);
    /// VCPI-mediated switch. `dir` 0 = to pmode (int 0x67 from V86),
    /// 1 = to real (far call through the host's code selector). The
    /// resume EIP/CS words in the switch-data block are patched before
    /// the host call.
    pub fn boot_vcpi_switch(switch_data: u32, dir: u32);
    /// Reload the canonical real-mode IDT (limit 0xFFFF, base 0).
    pub fn boot_load_real_idt();
}

/// Selector the VCPI host's code descriptor lands in; the pmode-side
/// host call goes through it.
const _: () = assert!(crate::tables::VCPI_CODE_SEL == 0x38);

global_asm!(
    r#"
    .section .trampoline, "ax"
    .code32

    // ---- scratch the transitions share ----
    .align 4
tramp_frame:        .space 28       // SwitchFrame copy
tramp_saved_esp:    .long 0
tramp_saved_ebp:    .long 0
tramp_real_idtr:    .short 0x3FF    // canonical real-mode IVT
                    .long 0
tramp_vcpi_data:    .long 0         // linear switch-data address

    // ---------------------------------------------------------------
    // boot_raw_enter_pmode(frame)
    // ---------------------------------------------------------------
    .global boot_raw_enter_pmode
boot_raw_enter_pmode:
    mov esi, [esp + 4]
    mov edi, offset tramp_frame
    mov ecx, 7
    rep movsd
    mov esi, [esp + 4]

    // lgdt/lidt want limit:base packed; build the 6-byte images on the
    // stack from the frame fields.
    sub esp, 8
    mov ax, [esi]                   // gdt_limit
    mov [esp], ax
    mov eax, [esi + 4]              // gdt_base
    mov [esp + 2], eax
    lgdt [esp]
    mov ax, [esi + 8]               // idt_limit
    mov [esp], ax
    mov eax, [esi + 12]             // idt_base
    mov [esp + 2], eax
    lidt [esp]
    add esp, 8

    mov eax, cr0
    or  eax, 1                      // CR0.PE
    mov cr0, eax

    // Serialize and load the final CS.
    movzx eax, word ptr [esi + 16]  // code_sel
    push eax
    push offset 1f
    retf
1:
    mov ax, [esi + 18]              // data_sel
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax
    lldt word ptr [esi + 26]        // ldt_sel
    ltr  word ptr [esi + 24]        // tss_sel
    ret

    // ---------------------------------------------------------------
    // boot_raw_leave_pmode(frame)
    // ---------------------------------------------------------------
    .global boot_raw_leave_pmode
boot_raw_leave_pmode:
    mov esi, [esp + 4]
    mov [tramp_saved_esp], esp

    // Data segments must carry 64 KiB real-compatible limits before PE
    // drops, or the stale descriptor caches fault in real mode.
    mov ax, [esi + 22]              // data16_sel
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax

    // Jump into a 16-bit code segment, then clear PE there.
    movzx eax, word ptr [esi + 20]  // code16_sel
    push eax
    push offset 2f
    retf
    .code16
2:
    mov eax, cr0
    and eax, ~1
    mov cr0, eax
    // Far jump to load a real-mode CS (segment 0 - the trampoline is
    // linked below 64 KiB).
    ljmp 0, offset 3f
3:
    xor ax, ax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax
    .code32
    mov esp, [tramp_saved_esp]
    ret

    // ---------------------------------------------------------------
    // boot_real_int(vector, regs) - real mode only
    // ---------------------------------------------------------------
    .global boot_real_int
boot_real_int:
    mov eax, [esp + 4]
    mov byte ptr [5f + 1], al       // patch the int imm8
    mov ebx, [esp + 8]
    mov [tramp_saved_ebp], ebp
    mov ebp, ebx

    mov eax, [ebp + 0]
    mov ebx, [ebp + 4]
    mov ecx, [ebp + 8]
    mov edx, [ebp + 12]
    mov esi, [ebp + 16]
    mov edi, [ebp + 20]
    mov ds,  [ebp + 28]
    mov es,  [ebp + 30]
5:  int 0
    mov [ebp + 0], eax
    mov [ebp + 4], ebx
    mov [ebp + 8], ecx
    mov [ebp + 12], edx
    mov [ebp + 16], esi
    mov [ebp + 20], edi
    mov [ebp + 28], ds
    mov [ebp + 30], es
    pushf
    pop word ptr [ebp + 32]
    xor ax, ax
    mov ds, ax
    mov es, ax
    mov ebp, [tramp_saved_ebp]
    ret

    // ---------------------------------------------------------------
    // boot_real_far_call(segment, offset, regs) - real mode only
    // ---------------------------------------------------------------
    .global boot_real_far_call
boot_real_far_call:
    mov eax, [esp + 8]
    mov [6f], ax                    // call target offset word
    mov eax, [esp + 4]
    mov [6f + 2], ax                // call target segment word
    mov ebx, [esp + 12]
    mov [tramp_saved_ebp], ebp
    mov ebp, ebx

    mov eax, [ebp + 0]
    mov ebx, [ebp + 4]
    mov ecx, [ebp + 8]
    mov edx, [ebp + 12]
    mov esi, [ebp + 16]
    mov edi, [ebp + 20]
    lcall [6f]
    mov [ebp + 0], eax
    mov [ebp + 4], ebx
    mov [ebp + 8], ecx
    mov [ebp + 12], edx
    mov ebp, [tramp_saved_ebp]
    ret
    .align 4
6:  .short 0                        // offset
    .short 0                        // segment

    // ---------------------------------------------------------------
    // boot_vcpi_switch(switch_data, dir)
    // ---------------------------------------------------------------
    .global boot_vcpi_switch
boot_vcpi_switch:
    mov esi, [esp + 4]
    mov [tramp_vcpi_data], esi
    mov [tramp_saved_esp], esp
    mov eax, [esp + 8]
    test eax, eax
    jnz 8f

    // To pmode: patch the resume point (EIP +16, CS +20 in the switch
    // data), then int 0x67 AX=0xDE0C with ESI = linear switch data.
    mov dword ptr [esi + 16], offset 7f
    mov ax, [tramp_frame + 16]      // code_sel
    mov [esi + 20], ax
    mov ax, 0xDE0C
    int 0x67
7:  // Host resumes us here in pmode with the frame's CS; the data
    // segments are the host's - reload ours.
    mov ax, [tramp_frame + 18]      // data_sel
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax
    mov esp, [tramp_saved_esp]
    ret

8:  // To real: far call the host entry through its GDT selector
    // (0x38) with AX=0xDE0C; the host IRETs into V86 at the
    // seg:off pushed on the stack.
    mov esi, [tramp_vcpi_data]
    xor eax, eax
    push eax                        // GS
    push eax                        // FS
    push eax                        // DS
    push eax                        // ES
    push eax                        // SS (segment 0)
    mov eax, offset 9f
    add eax, 0x10000                // room below the resume stack
    push eax                        // ESP... placeholder, host reloads
    push 0                          // reserved EFLAGS image
    push 0                          // CS segment 0
    push offset 9f                  // IP
    mov ax, 0xDE0C
    lcall 0x38, offset 0            // host pmode entry, offset ignored
9:  // Back in real mode on the pushed CS:IP.
    xor ax, ax
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov esp, [tramp_saved_esp]
    ret

    // ---------------------------------------------------------------
    .global boot_load_real_idt
boot_load_real_idt:
    lidt [tramp_real_idtr]
    ret
"#
);

/// Rust-callable wrappers with the right types.
pub fn real_int(vector: u8, regs: &mut RegisterBlock) {
    unsafe { boot_real_int(vector as u32, regs) }
}

pub fn real_far_call(entry: RealPtr, regs: &mut RegisterBlock) {
    unsafe { boot_real_far_call(entry.segment as u32, entry.offset as u32, regs) }
}
