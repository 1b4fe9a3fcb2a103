#![allow(clippy::float_cmp)]

use spmd::request::WaitGuard;
use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();

    let x = std::f32::consts::PI;
    let mut y: f32 = 0.0;

    spmd::request::scope(|scope| -> spmd::Result<()> {
        let mut sreq = world.this_process().immediate_send(scope, &x);
        let rreq = world.any_process().immediate_receive_into(scope, &mut y);

        rreq.wait()?;
        loop {
            match sreq.test() {
                Ok(status) => {
                    status?;
                    break;
                }
                Err(req) => {
                    sreq = req;
                }
            }
        }
        Ok(())
    })?;
    assert_eq!(x, y);

    y = 0.0;
    spmd::request::scope(|scope| {
        // Guards complete their request when they go out of scope.
        let _rreq = WaitGuard::from(world.any_process().immediate_receive_into(scope, &mut y));
        let _sreq = WaitGuard::from(world.this_process().immediate_send(scope, &x));
    });
    assert_eq!(x, y);

    assert!(world.any_process().immediate_probe()?.is_none());
    assert!(world.any_process().immediate_matched_probe()?.is_none());

    y = 0.0;
    world.this_process().send(&x)?;
    let (msg, _) = world
        .any_process()
        .immediate_matched_probe()?
        .expect("a message sent to oneself arrives immediately");
    msg.matched_receive_into(&mut y)?;
    assert_eq!(x, y);

    let future = world.any_process().immediate_receive();
    world.this_process().send(&x)?;
    let (msg, _) = future.get()?;
    assert_eq!(x, msg);

    let future = world.any_process().immediate_receive::<f32>();
    let mut future = match future.r#try() {
        Ok(_) => unreachable!("nothing has been sent yet"),
        Err(future) => future,
    };
    world.this_process().send(&x)?;
    loop {
        match future.r#try() {
            Ok(received) => {
                let (msg, _) = received?;
                assert_eq!(x, msg);
                break;
            }
            Err(f) => {
                future = f;
            }
        }
    }
    Ok(())
}
