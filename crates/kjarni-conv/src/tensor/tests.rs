use super::*;
use ndarray::Array4;

#[test]
fn test_new_rejects_wrong_rank() {
    assert!(Buffer::new(&[2, 3, 4], Layout::Nhwc, DType::U8).is_err());
    assert!(Buffer::new(&[2, 3, 4, 5], Layout::X, DType::S32).is_err());
}

#[test]
fn test_new_rejects_undef() {
    assert!(Buffer::new(&[4], Layout::X, DType::Undef).is_err());
}

#[test]
fn test_sizes_follow_dtype() {
    let src = Buffer::nhwc([2, 32, 4, 4], DType::U8).unwrap();
    assert_eq!(src.len(), 2 * 32 * 4 * 4);
    assert_eq!(src.size_in_bytes(), 2 * 32 * 4 * 4);

    let dst = Buffer::nhwc([2, 32, 4, 4], DType::F32).unwrap();
    assert_eq!(dst.size_in_bytes(), 4 * 2 * 32 * 4 * 4);

    let bias = Buffer::from_vec(vec![1i32, 2, 3]);
    assert_eq!(bias.dims(), &[3]);
    assert_eq!(bias.dtype(), DType::S32);
    assert_eq!(bias.size_in_bytes(), 12);
}

#[test]
fn test_array_roundtrip_through_nhwc() {
    let array = Array4::from_shape_fn((2, 3, 2, 2), |(n, c, h, w)| (n * 24 + c * 4 + h * 2 + w) as u8);
    let buffer = Buffer::from_array(array.view(), Layout::Nhwc).unwrap();

    // physical order is channel-minor
    let raw = buffer.to_vec::<u8>().unwrap();
    assert_eq!(&raw[..3], &[0, 4, 8]);

    assert_eq!(buffer.to_array::<u8>().unwrap(), array);
}

#[test]
fn test_array_roundtrip_through_blocked_weights() {
    let array = Array4::from_shape_fn((32, 16, 3, 3), |(o, i, h, w)| {
        (((o * 7 + i * 3 + h + w) % 200) as i32 - 100) as i8
    });
    let buffer = Buffer::from_array(array.view(), Layout::OIhw4i16o4i).unwrap();
    assert_eq!(buffer.to_array::<i8>().unwrap(), array);
}

#[test]
fn test_typed_access_checks_kind() {
    let buffer = Buffer::nhwc([1, 1, 1, 4], DType::S8).unwrap();
    assert!(buffer.to_vec::<u8>().is_err());
    assert!(buffer.fill_with(|i| i as i8).is_ok());
    assert_eq!(buffer.to_vec::<i8>().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(buffer.read().as_bytes(), &[0, 1, 2, 3]);
}

#[test]
fn test_clones_share_storage() {
    let a = Buffer::nhwc([1, 1, 1, 2], DType::U8).unwrap();
    let b = a.clone();
    let c = Buffer::nhwc([1, 1, 1, 2], DType::U8).unwrap();
    b.fill_with(|_| 9u8).unwrap();

    assert_eq!(a.to_vec::<u8>().unwrap(), vec![9, 9]);
    assert!(a.same_storage(&b));
    assert!(!a.same_storage(&c));
}

#[test]
fn test_copy_from_array_rejects_shape_mismatch() {
    let buffer = Buffer::nhwc([1, 2, 2, 2], DType::U8).unwrap();
    let wrong = Array4::<u8>::zeros((1, 2, 2, 3));
    assert!(buffer.copy_from_array(wrong.view()).is_err());
}
