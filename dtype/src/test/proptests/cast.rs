use proptest::prelude::*;

use crate::DType;

proptest! {
    #[test]
    fn safe_cast_is_reflexive(dtype: DType) {
        prop_assert!(dtype.can_safe_cast(dtype));
    }

    #[test]
    fn legalized_never_widens(dtype in super::generators::any_dtype()) {
        prop_assert!(dtype.legalized().bytes() <= dtype.bytes());
    }

    #[test]
    fn legalized_is_target_supported(dtype: DType) {
        prop_assert!(dtype.legalized().is_target_supported());
    }

    #[test]
    fn legalized_is_idempotent(dtype in super::generators::any_dtype()) {
        prop_assert_eq!(dtype.legalized().legalized(), dtype.legalized());
    }

    #[test]
    fn name_roundtrips(dtype: DType) {
        prop_assert_eq!(dtype.name().parse::<DType>().ok(), Some(dtype));
    }
}
