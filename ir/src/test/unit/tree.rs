use crate::op;
use crate::test::helpers::*;

#[test]
fn tree_lists_producers_with_ports() {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 4]);
    let w = constant(&mut g, "w", vector(&[1., 2., 3., 4.]));
    let add = node(&mut g, "add", op::Add {});
    link_shaped(&mut g, x, add, 0, 0, &[1, 4]);
    link(&mut g, w, add, 0, 1);
    output(&mut g, add, &[1, 4]);

    let tree = g.tree(add);
    assert!(tree.contains("add : Add -> [1, 4]"));
    assert!(tree.contains("[0] x : Input"));
    assert!(tree.contains("[1] w : Constant"));
}

#[test]
fn shared_producer_is_printed_once() {
    let mut g = graph();
    let x = input(&mut g, "x", &[4]);
    let mul = node(&mut g, "mul", op::Mul {});
    link(&mut g, x, mul, 0, 0);
    link(&mut g, x, mul, 0, 1);

    let tree = g.tree(mul);
    assert_eq!(tree.matches("x : Input").count(), 1);
    assert!(tree.contains("x (see above)"));
}
