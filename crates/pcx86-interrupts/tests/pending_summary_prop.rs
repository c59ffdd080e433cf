use std::sync::Arc;
use std::thread;

use pcx86_interrupts::pic8259::{MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};
use pcx86_interrupts::DualPic8259;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Raise(u8),
    Lower(u8),
    MaskMaster(u8),
    MaskSlave(u8),
    Service,
    EoiBoth,
}

fn device_line() -> impl Strategy<Value = u8> {
    (0u8..16).prop_filter("master line 2 is the cascade", |line| *line != 2)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => device_line().prop_map(Op::Raise),
        2 => device_line().prop_map(Op::Lower),
        1 => any::<u8>().prop_map(Op::MaskMaster),
        1 => any::<u8>().prop_map(Op::MaskSlave),
        2 => Just(Op::Service),
        1 => Just(Op::EoiBoth),
    ]
}

fn init(pics: &DualPic8259) {
    for (cmd, data, base, icw3) in [
        (MASTER_CMD, MASTER_DATA, 0x20, 0x04),
        (SLAVE_CMD, SLAVE_DATA, 0x28, 0x02),
    ] {
        pics.port_write_u8(cmd, 0x11).unwrap();
        pics.port_write_u8(data, base).unwrap();
        pics.port_write_u8(data, icw3).unwrap();
        pics.port_write_u8(data, 0x01).unwrap();
    }
}

fn expected_summary(pics: &DualPic8259) -> u16 {
    let master = pics.master().request() & !pics.master().mask();
    let slave = pics.slave().request() & !pics.slave().mask();
    u16::from(master) | (u16::from(slave) << 8)
}

proptest! {
    #[test]
    fn summary_tracks_registers(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let pics = DualPic8259::default();
        init(&pics);

        for op in ops {
            match op {
                Op::Raise(line) => pics.raise_irq(line),
                Op::Lower(line) => pics.lower_irq(line),
                Op::MaskMaster(mask) => pics.port_write_u8(MASTER_DATA, mask).unwrap(),
                Op::MaskSlave(mask) => pics.port_write_u8(SLAVE_DATA, mask).unwrap(),
                Op::Service => {
                    if let Some(vector) = pics.service() {
                        prop_assert_ne!(vector, 0x22);
                    }
                }
                Op::EoiBoth => {
                    let slave_isr = pics.slave().in_service();
                    let master_isr = pics.master().in_service();
                    let _ = pics.port_write_u8(SLAVE_CMD, 0x20);
                    let _ = pics.port_write_u8(MASTER_CMD, 0x20);
                    // Non-specific EOI clears only the highest-priority bit.
                    prop_assert_eq!(
                        pics.slave().in_service(),
                        slave_isr & slave_isr.wrapping_sub(1)
                    );
                    prop_assert_eq!(
                        pics.master().in_service(),
                        master_isr & master_isr.wrapping_sub(1)
                    );
                }
            }

            prop_assert_eq!(pics.pending_summary(), expected_summary(&pics));
            let slave_requesting = pics.slave().request() != 0;
            let cascade_requested = pics.master().request() & 0x04 != 0;
            prop_assert_eq!(slave_requesting, cascade_requested);
            prop_assert_eq!(
                pics.has_deliverable(),
                pics.pending_summary() & !0x04 != 0
            );
        }
    }
}

#[test]
fn raise_from_other_thread_is_visible() {
    let pics = Arc::new(DualPic8259::default());
    init(&pics);

    let workers: Vec<_> = [0u8, 1, 8, 13]
        .into_iter()
        .map(|line| {
            let pics = Arc::clone(&pics);
            thread::spawn(move || {
                for _ in 0..1000 {
                    pics.raise_irq(line);
                    pics.lower_irq(line);
                }
                pics.raise_irq(line);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pics.pending_summary(), 0b0010_0001_0000_0111);
    let mut vectors = Vec::new();
    while let Some(vector) = pics.service() {
        vectors.push(vector);
    }
    assert_eq!(vectors, vec![0x20, 0x21, 0x28, 0x2D]);
    assert_eq!(pics.pending_summary(), 0);
}
