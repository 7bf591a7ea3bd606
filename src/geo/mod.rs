use crate::error::AppError;
use crate::models::courier::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn validate(point: &GeoPoint) -> Result<(), AppError> {
    let lat_ok = point.lat.is_finite() && (-90.0..=90.0).contains(&point.lat);
    let lng_ok = point.lng.is_finite() && (-180.0..=180.0).contains(&point.lng);

    if lat_ok && lng_ok {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "coordinates out of range: ({}, {})",
            point.lat, point.lng
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, validate};
    use crate::models::courier::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 13.7563,
            lng: 100.5018,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn bangkok_to_chiang_mai_is_around_583_km() {
        let bangkok = GeoPoint {
            lat: 13.7563,
            lng: 100.5018,
        };
        let chiang_mai = GeoPoint {
            lat: 18.7883,
            lng: 98.9853,
        };
        let distance = haversine_km(&bangkok, &chiang_mai);
        assert!((distance - 583.0).abs() < 10.0);
    }

    #[test]
    fn rejects_out_of_range_and_non_finite() {
        assert!(validate(&GeoPoint { lat: 91.0, lng: 0.0 }).is_err());
        assert!(validate(&GeoPoint { lat: 0.0, lng: f64::NAN }).is_err());
        assert!(validate(&GeoPoint { lat: 13.75, lng: 100.5 }).is_ok());
    }
}
