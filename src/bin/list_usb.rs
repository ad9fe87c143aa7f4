use sony_ptp_bridge::finder;

fn main() {
    env_logger::init();

    println!("USB Devices:");
    println!("Bus\tDevice\tVendor:Product\tDescription");
    println!("---\t------\t--------------\t-----------");

    for device in finder::list_all_sony() {
        println!(
            "{:03}\t{:03}\t{:04x}:{:04x}\t{}",
            device.bus, device.address, device.vendor_id, device.product_id, device.product_name
        );
    }
}
