use flashvm_devices::config::{BusDeviceConfig, ResourceConfig, VmConfig};
use flashvm_devices::types::{ResourceType, Width};
use flashvm_devices::vmm::factory::DeviceFactory;
use flashvm_devices::vmm::io_proxy::IoProxy;
use flashvm_devices::vmm::irq::{InterruptController, IrqChip, IrqSource};
use flashvm_devices::vmm::serial::SerialFactory;
use flashvm_devices::{DeviceTree, Vm, VmmError};
use std::io::Write;
use std::sync::{Arc, Mutex};
use vm_fdt::{Error, FdtWriter};

const IC_PHANDLE: u32 = 1;
const NIC_BASE: u64 = 0x1000_0000;

fn dtb(body: impl FnOnce(&mut FdtWriter) -> Result<(), Error>) -> Vec<u8> {
    let mut fdt = FdtWriter::new().unwrap();
    let root = fdt.begin_node("").unwrap();
    fdt.property_u32("interrupt-parent", IC_PHANDLE).unwrap();
    body(&mut fdt).unwrap();
    fdt.end_node(root).unwrap();
    fdt.finish().unwrap()
}

fn irqchip(fdt: &mut FdtWriter) -> Result<(), Error> {
    let ic = fdt.begin_node("intc")?;
    fdt.property_string("compatible", "flashvm,irqchip")?;
    fdt.property_null("interrupt-controller")?;
    fdt.property_u32("#interrupt-cells", 1)?;
    fdt.property_u32("phandle", IC_PHANDLE)?;
    fdt.end_node(ic)
}

fn nic_node(fdt: &mut FdtWriter, interrupts: &[u32]) -> Result<(), Error> {
    let nic = fdt.begin_node("nic@10000000")?;
    fdt.property_string("compatible", "vendor,nic")?;
    fdt.property_array_u32("reg", &[0x1000_0000, 0x1000])?;
    fdt.property_array_u32("interrupts", interrupts)?;
    fdt.end_node(nic)
}

fn res(kind: ResourceType, id: &str, start: u64, end: u64) -> ResourceConfig {
    ResourceConfig { kind, id: id.into(), start, end }
}

fn nic(resources: Vec<ResourceConfig>) -> BusDeviceConfig {
    BusDeviceConfig { name: "eth0".into(), hid: "vendor,nic".into(), resources }
}

fn vm_with(bus_devices: Vec<BusDeviceConfig>) -> Vm {
    let cfg = VmConfig { memory_mb: 4, bus_devices, ..VmConfig::default() };
    Vm::new(cfg).unwrap()
}

fn chip(vm: &Vm, dt: &DeviceTree) -> Arc<IrqChip> {
    vm.device_from_node(dt.find_node("/intc").unwrap()).unwrap().downcast::<IrqChip>().unwrap()
}

#[test]
fn passthrough_binds_irqs_and_mmio() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5, 6])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![
        res(ResourceType::Mem, "reg0", NIC_BASE, NIC_BASE + 0xfff),
        res(ResourceType::Irq, "irq0", 40, 40),
        res(ResourceType::Irq, "irq1", 41, 41),
    ])]);
    vm.scan_device_tree(&dt).unwrap();

    let chip = chip(&vm, &dt);
    assert_eq!(chip.irq_source(5).unwrap().host_irq(), Some(40));
    assert_eq!(chip.irq_source(6).unwrap().host_irq(), Some(41));
    assert_eq!(vm.event_loop().len(), 2);
    assert!(vm.bus().devices()[0].is_assigned());

    // Bound lines are live and idle.
    let icu = vm.bus().icu().clone();
    assert!(!icu.is_masked(40));
    assert!(icu.trigger(40).unwrap());
    assert_eq!(vm.event_loop().dispatch_pending(), 1);
    assert!(chip.is_pending(5));
    assert!(!chip.is_pending(6));

    // MMIO window maps the bus dataspace one-to-one.
    vm.mmio_bus().write(NIC_BASE + 8, Width::Dword, 0x1234_5678);
    assert_eq!(vm.mmio_bus().read(NIC_BASE + 8, Width::Dword), 0x1234_5678);
    assert!(!vm.mmio_bus().is_mapped(NIC_BASE + 0x1000));
}

#[test]
fn duplicate_binding_of_one_line_is_a_noop() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5, 5])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![
        res(ResourceType::Irq, "irq0", 40, 40),
        res(ResourceType::Irq, "irq1", 40, 40),
    ])]);
    vm.scan_device_tree(&dt).unwrap();

    let node = dt.find_node("/nic@10000000").unwrap();
    let proxy = vm.device_from_node(node).unwrap().downcast::<IoProxy>().unwrap();
    let ic: Arc<dyn InterruptController> = chip(&vm, &dt);
    proxy.bind_irq(&vm, &ic, node, 0, 40).unwrap();

    assert_eq!(proxy.irq_servers().len(), 1);
    assert_eq!(vm.event_loop().len(), 1);
    assert_eq!(ic.irq_source(5).unwrap().host_irq(), Some(40));
}

#[test]
fn conflicting_host_irq_aborts_scan() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5, 5])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![
        res(ResourceType::Irq, "irq0", 40, 40),
        res(ResourceType::Irq, "irq1", 41, 41),
    ])]);

    let err = vm.scan_device_tree(&dt).unwrap_err();
    assert!(matches!(err, VmmError::IrqConflict { dt_irq: 5, .. }));
    assert_eq!(err.errno(), libc::EEXIST);

    // The first binding is untouched.
    assert_eq!(chip(&vm, &dt).irq_source(5).unwrap().host_irq(), Some(40));
    assert_eq!(vm.event_loop().len(), 1);
}

#[test]
fn rebinding_a_line_to_another_host_irq_fails() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Irq, "irq0", 40, 40)])]);
    vm.scan_device_tree(&dt).unwrap();

    let node = dt.find_node("/nic@10000000").unwrap();
    let proxy = vm.device_from_node(node).unwrap().downcast::<IoProxy>().unwrap();
    let ic: Arc<dyn InterruptController> = chip(&vm, &dt);
    assert!(matches!(proxy.bind_irq(&vm, &ic, node, 0, 99), Err(VmmError::IrqConflict { .. })));
    assert_eq!(ic.irq_source(5).unwrap().host_irq(), Some(40));
    assert!(!vm.bus().icu().is_bound(99));
}

struct GuestSource;

impl IrqSource for GuestSource {
    fn eoi(&self) {}
}

#[test]
fn line_owned_by_non_host_source_conflicts() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[7])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![])]);
    vm.scan_device_tree(&dt).unwrap();

    let node = dt.find_node("/nic@10000000").unwrap();
    let proxy = vm.device_from_node(node).unwrap().downcast::<IoProxy>().unwrap();
    let ic: Arc<dyn InterruptController> = chip(&vm, &dt);
    ic.bind_irq_source(7, Arc::new(GuestSource));
    assert!(matches!(proxy.bind_irq(&vm, &ic, node, 0, 40), Err(VmmError::IrqConflict { dt_irq: 7, .. })));
}

#[test]
fn out_of_range_irq_index_is_skipped() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[1, 2, 3])
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![
        res(ResourceType::Irq, "irq0", 40, 40),
        res(ResourceType::Irq, "irq5", 45, 45),
    ])]);
    vm.scan_device_tree(&dt).unwrap();

    assert_eq!(vm.event_loop().len(), 1);
    assert!(!vm.bus().icu().is_bound(45));
    assert!(vm.bus().icu().is_bound(40));
}

#[test]
fn malformed_resource_index_is_fatal() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[1])
    }))
    .unwrap();

    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Mem, "regA", NIC_BASE, NIC_BASE + 0xfff)])]);
    let err = vm.scan_device_tree(&dt).unwrap_err();
    assert!(matches!(err, VmmError::InvalidResourceId { expected: "reg", .. }));
    assert_eq!(err.errno(), libc::EINVAL);

    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Irq, "irq?", 40, 40)])]);
    assert!(matches!(vm.scan_device_tree(&dt), Err(VmmError::InvalidResourceId { expected: "irq", .. })));
}

#[test]
fn passthrough_without_interrupt_controller_is_fatal() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| nic_node(fdt, &[5]))).unwrap();
    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Irq, "irq0", 40, 40)])]);
    let err = vm.scan_device_tree(&dt).unwrap_err();
    assert!(matches!(err, VmmError::NoIrqController(_)));
    assert_eq!(err.errno(), libc::ENODEV);
}

#[test]
fn unmatched_and_disabled_nodes_are_left_alone() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        let n = fdt.begin_node("sensor@20")?;
        fdt.property_string("compatible", "vendor,sensor")?;
        fdt.property_array_u32("reg", &[0x20, 0x4])?;
        fdt.end_node(n)?;
        let n = fdt.begin_node("pit")?;
        fdt.property_string("compatible", "intel,8254")?;
        fdt.property_string("status", "disabled")?;
        fdt.end_node(n)
    }))
    .unwrap();
    let mut vm = vm_with(vec![]);
    vm.scan_device_tree(&dt).unwrap();

    assert!(vm.device_from_node(dt.find_node("/sensor@20").unwrap()).is_none());
    assert!(vm.device_from_node(dt.find_node("/pit").unwrap()).is_none());
    assert_eq!(vm.devices().len(), 1);
    assert_eq!(vm.port_bus().io_in(0x61, Width::Byte), 0xff);
}

#[test]
fn bus_device_can_be_named_explicitly() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        let n = fdt.begin_node("storage")?;
        fdt.property_string("compatible", "board,storage")?;
        fdt.property_string("flashvm,vbus-dev", "disk1")?;
        fdt.property_array_u32("interrupts", &[9])?;
        fdt.end_node(n)
    }))
    .unwrap();
    let disk = |name: &str, irq: u64| BusDeviceConfig {
        name: name.into(),
        hid: "vendor,ahci".into(),
        resources: vec![res(ResourceType::Irq, "irq0", irq, irq)],
    };
    let mut vm = vm_with(vec![disk("disk0", 50), disk("disk1", 51)]);
    vm.scan_device_tree(&dt).unwrap();

    assert_eq!(chip(&vm, &dt).irq_source(9).unwrap().host_irq(), Some(51));
    assert!(!vm.bus().devices()[0].is_assigned());
    assert!(vm.bus().devices()[1].is_assigned());
}

#[test]
fn msi_parent_accepts_a_single_reference() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        let its = fdt.begin_node("its")?;
        fdt.property_u32("phandle", 2)?;
        fdt.end_node(its)?;
        let a = fdt.begin_node("pci-a")?;
        fdt.property_u32("msi-parent", 2)?;
        fdt.end_node(a)?;
        let b = fdt.begin_node("pci-b")?;
        fdt.property_array_u32("msi-parent", &[2, 0x100])?;
        fdt.end_node(b)?;
        let c = fdt.begin_node("pci-c")?;
        fdt.property_u32("msi-parent", 77)?;
        fdt.end_node(c)
    }))
    .unwrap();
    let vm = vm_with(vec![]);

    let parent = vm.find_msi_parent(dt.find_node("/pci-a").unwrap()).unwrap();
    assert_eq!(parent.unwrap().path(), "/its");
    assert!(vm.find_msi_parent(dt.find_node("/its").unwrap()).unwrap().is_none());
    assert!(vm.find_msi_parent(dt.find_node("/pci-c").unwrap()).unwrap().is_none());

    let err = vm.find_msi_parent(dt.find_node("/pci-b").unwrap()).unwrap_err();
    assert!(matches!(err, VmmError::MsiParent(_)));
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

#[test]
fn virtual_devices_come_up_before_their_controller_node() {
    // The uart precedes the controller in tree order.
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        let uart = fdt.begin_node("uart@3f8")?;
        fdt.property_string("compatible", "ns16550a")?;
        fdt.property_array_u32("reg", &[0x3f8, 8])?;
        fdt.property_u32("interrupts", 4)?;
        fdt.end_node(uart)?;
        let pit = fdt.begin_node("pit@40")?;
        fdt.property_string("compatible", "intel,8254")?;
        fdt.end_node(pit)?;
        irqchip(fdt)
    }))
    .unwrap();

    let out = SharedBuf::default();
    let factory: Arc<dyn DeviceFactory> = {
        let out = out.clone();
        Arc::new(SerialFactory::new(Arc::new(move || Box::new(out.clone()) as Box<dyn Write + Send>)))
    };
    let mut vm = vm_with(vec![]);
    vm.register_factory("ns16550a", factory);
    vm.scan_device_tree(&dt).unwrap();
    assert_eq!(vm.devices().len(), 3);

    // IER: transmitter holding register empty
    vm.port_bus().io_out(0x3f9, Width::Byte, 0x02);
    for b in b"ok" {
        vm.port_bus().io_out(0x3f8, Width::Byte, u32::from(*b));
    }
    assert_eq!(out.0.lock().unwrap().as_slice(), b"ok");
    assert!(chip(&vm, &dt).is_pending(4));

    // PIT: program channel 0 and read it back through the port bus.
    vm.port_bus().io_out(0x43, Width::Byte, 0x34);
    vm.port_bus().io_out(0x40, Width::Byte, 0xff);
    vm.port_bus().io_out(0x40, Width::Byte, 0xff);
    vm.port_bus().io_out(0x43, Width::Byte, 0xc0 | 0x20 | 0x02);
    assert_eq!(vm.port_bus().io_in(0x40, Width::Byte) & 0x3f, 0x34);
}

#[test]
fn build_vm_from_json_config() {
    let blob = dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5])
    });
    let path = std::env::temp_dir().join(format!("flashvm-scan-{}.dtb", std::process::id()));
    std::fs::write(&path, blob).unwrap();

    let json = format!(
        r#"{{
            "memory_mb": 4,
            "dtb": {:?},
            "bus_devices": [
                {{ "name": "eth0", "hid": "vendor,nic",
                   "resources": [ {{ "kind": "irq", "id": "irq0", "start": 40, "end": 40 }} ] }}
            ]
        }}"#,
        path.to_str().unwrap()
    );
    let cfg = VmConfig::from_json(&json).unwrap();
    let vm = flashvm_devices::build_vm(&cfg).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(vm.devices().len(), 2);
    assert!(vm.bus().icu().is_bound(40));

    let missing = VmConfig { dtb: Some(path), ..cfg };
    let err = flashvm_devices::build_vm(&missing).unwrap_err();
    assert!(err.to_string().contains("loading device tree"));
}

#[test]
fn host_irq_shared_by_two_lines_is_refused() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5])?;
        let n = fdt.begin_node("disk")?;
        fdt.property_string("compatible", "vendor,ahci")?;
        fdt.property_u32("interrupts", 6)?;
        fdt.end_node(n)
    }))
    .unwrap();
    let disk = BusDeviceConfig {
        name: "disk0".into(),
        hid: "vendor,ahci".into(),
        resources: vec![res(ResourceType::Irq, "irq0", 40, 40)],
    };
    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Irq, "irq0", 40, 40)]), disk]);

    let err = vm.scan_device_tree(&dt).unwrap_err();
    assert!(matches!(err, VmmError::HostIrqBusy { host_irq: 40 }));
    assert_eq!(err.errno(), libc::EBUSY);

    // Only the server that owns the host line is registered.
    assert_eq!(vm.event_loop().len(), 1);
    let chip = chip(&vm, &dt);
    assert_eq!(chip.irq_source(5).unwrap().host_irq(), Some(40));
    assert!(chip.irq_source(6).is_none());
}

#[test]
fn claimed_bus_device_is_not_taken_again() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        irqchip(fdt)?;
        nic_node(fdt, &[5])?;
        let n = fdt.begin_node("nic2")?;
        fdt.property_string("compatible", "board,nic")?;
        fdt.property_string("flashvm,vbus-dev", "eth0")?;
        fdt.property_array_u32("reg", &[0x1000_0000, 0x1000])?;
        fdt.end_node(n)
    }))
    .unwrap();
    let mut vm = vm_with(vec![nic(vec![res(ResourceType::Mem, "reg0", NIC_BASE, NIC_BASE + 0xfff)])]);
    let eth0 = vm.bus().devices()[0].clone();
    assert!(vm.bus().assign(&eth0));

    vm.scan_device_tree(&dt).unwrap();
    assert!(vm.device_from_node(dt.find_node("/nic@10000000").unwrap()).is_none());
    assert!(vm.device_from_node(dt.find_node("/nic2").unwrap()).is_none());
    assert!(!vm.mmio_bus().is_mapped(NIC_BASE));
}

#[test]
fn pit_at_top_of_port_space_fails_cleanly() {
    let dt = DeviceTree::from_blob(&dtb(|fdt| {
        let n = fdt.begin_node("pit")?;
        fdt.property_string("compatible", "intel,8254")?;
        fdt.end_node(n)
    }))
    .unwrap();
    let mut cfg = VmConfig { memory_mb: 4, ..VmConfig::default() };
    cfg.pit.base_port = 0xfffe;
    let mut vm = Vm::new(cfg).unwrap();

    assert!(matches!(vm.scan_device_tree(&dt), Err(VmmError::Config(_))));
    assert_eq!(vm.port_bus().io_in(0xfffe, Width::Byte), 0xff);
}
