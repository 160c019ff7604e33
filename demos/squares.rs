use observable::Observable;

fn main() {
    // Create an Observable<u32> which delivers every value it is given to its
    // subscribers.
    let numbers = Observable::new();

    // One subscriber prints each value, the other prints its square.
    let values = numbers.subscribe(|value: &u32| println!("{value}"));
    let squares = numbers.subscribe(|value: &u32| println!("{}", value * value));

    // Both subscribers receive these, in the order they subscribed.
    numbers.next(10);
    numbers.next(20);

    // Once unsubscribed, the squaring callback is no longer invoked.
    squares.unsubscribe();

    numbers.next(30);
    numbers.next(40);

    println!("squares valid: {}", squares.is_valid());
    println!("values valid: {}", values.is_valid());
}

#[test]
fn runs() {
    main()
}
