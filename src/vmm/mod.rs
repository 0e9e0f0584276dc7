pub mod bus;
pub mod device_repo;
pub mod device_tree;
pub mod devices;
pub mod event_loop;
pub mod factory;
pub mod io_bus;
pub mod io_proxy;
pub mod irq;
pub mod memory;
pub mod pit;
pub mod run;
pub mod serial;
pub mod vm;


#[cfg(test)]
pub(crate) mod testing {
    use vm_fdt::{Error, FdtWriter};

    /// DTB with a root node whose contents `body` writes.
    pub fn dtb(body: impl FnOnce(&mut FdtWriter) -> Result<(), Error>) -> Vec<u8> {
        let mut fdt = FdtWriter::new().unwrap();
        let root = fdt.begin_node("").unwrap();
        body(&mut fdt).unwrap();
        fdt.end_node(root).unwrap();
        fdt.finish().unwrap()
    }
}
