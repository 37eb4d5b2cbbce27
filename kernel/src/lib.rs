#![no_std]
// Kernel crate — placeholder for the 32-bit kernel proper.
// kestrel-boot hands over in protected mode with:
// 1. GDT/IDT/LDT/TSS loaded from CpuTables
// 2. Every discovered physical byte merged into PhysMemPool
// 3. The transition layer live for real-mode service calls
