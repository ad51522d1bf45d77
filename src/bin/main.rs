fn main() {
  duned::main()
}
