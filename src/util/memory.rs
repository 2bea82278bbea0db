use crate::util::Address;
use std::io::{Error, Result};

/// Zero `len` bytes starting at `start`.
pub fn zero(start: Address, len: usize) {
    unsafe { std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len) }
}

/// mmap with no swap space reserve:
/// This maps a fresh anonymous range but doesn't occupy any physical memory until
/// the pages are first touched. The kernel picks the address.
pub fn mmap_noreserve(size: usize) -> Result<Address> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ret = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ret))
    }
}

/// Give the physical pages behind a range back to the OS. The range stays mapped
/// and reads as zero afterwards.
pub fn decommit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn test_mmap_noreserve() {
        let start = mmap_noreserve(4 * BYTES_IN_PAGE).unwrap();
        assert!(start.is_aligned_to(BYTES_IN_PAGE));
        unsafe {
            assert_eq!(start.load::<usize>(), 0);
            start.store(42usize);
            assert_eq!(start.load::<usize>(), 42);
        }
        assert!(munmap(start, 4 * BYTES_IN_PAGE).is_ok());
    }

    #[test]
    fn test_decommit_reads_zero() {
        let start = mmap_noreserve(BYTES_IN_PAGE).unwrap();
        unsafe { (start + 64usize).store(0xdeadusize) };
        decommit(start, BYTES_IN_PAGE).unwrap();
        assert_eq!(unsafe { (start + 64usize).load::<usize>() }, 0);
        munmap(start, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn test_zero() {
        let start = mmap_noreserve(BYTES_IN_PAGE).unwrap();
        unsafe {
            start.store(u64::MAX);
            (start + 8usize).store(u64::MAX);
        }
        zero(start, 8);
        unsafe {
            assert_eq!(start.load::<u64>(), 0);
            assert_eq!((start + 8usize).load::<u64>(), u64::MAX);
        }
        munmap(start, BYTES_IN_PAGE).unwrap();
    }
}
