use criterion::{black_box, criterion_group, criterion_main, Criterion};
use manifold::matcher::MatchRule;
use manifold::message::{Arg, Message, FRAME_HEADER_SIZE};
use manifold::{DRIVER_INTERFACE, DRIVER_NAME};

fn bench_message(c: &mut Criterion) {
    let mut msg = Message::method_call(DRIVER_NAME, DRIVER_INTERFACE, "RequestName")
        .with_arg(Arg::Str("org.example.SomeFairlyLongServiceName".to_string()))
        .with_arg(Arg::U32(2));
    msg.serial = 42;
    msg.sender = Some(":1.982".to_string());
    msg.path = Some("/org/example/Object".to_string());

    let frame = msg.encode().unwrap();

    c.bench_function("message_encode", |b| {
        b.iter(|| black_box(&msg).encode().unwrap())
    });

    c.bench_function("message_decode", |b| {
        b.iter(|| Message::decode(black_box(&frame[FRAME_HEADER_SIZE..])).unwrap())
    });
}

fn bench_rule_parse(c: &mut Criterion) {
    let text = "type='signal',interface='org.example.Iface',member='Changed',\
                path='/org/example',sender='org.example.Svc'";

    c.bench_function("match_rule_parse", |b| {
        b.iter(|| MatchRule::parse(0, black_box(text)).unwrap())
    });
}

criterion_group!(benches, bench_message, bench_rule_parse);
criterion_main!(benches);
